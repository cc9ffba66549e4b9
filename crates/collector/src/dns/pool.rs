//! 스크래치 버퍼 풀
//!
//! 수용된 데이터그램의 페이로드는 풀에서 빌린 [`BytesMut`]에 복사되어
//! 트랜잭션이 소유합니다. 디스패치가 끝나면 버퍼를 비우고 풀에 돌려줍니다.

use std::sync::Mutex;

use bytes::BytesMut;

/// 스크래치 버퍼 풀
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    capacity: usize,
    buffer_size: usize,
}

impl BufferPool {
    /// 최대 `capacity`개의 버퍼를 보관하는 풀을 생성합니다.
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            buffer_size,
        }
    }

    /// 버퍼를 빌립니다. 풀이 비어 있으면 새로 할당합니다.
    pub fn acquire(&self) -> BytesMut {
        self.free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size))
    }

    /// 버퍼를 돌려줍니다. 풀이 가득 차 있으면 버립니다.
    pub fn release(&self, mut buf: BytesMut) {
        buf.clear();
        if let Ok(mut free) = self.free.lock() {
            if free.len() < self.capacity {
                free.push(buf);
            }
        }
    }

    /// 풀에 보관 중인 버퍼 수를 반환합니다.
    pub fn available(&self) -> usize {
        self.free.lock().map(|f| f.len()).unwrap_or(0)
    }
}
