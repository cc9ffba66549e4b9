//! 싱크 스테이지 구현
//!
//! - [`JsonLinesSink`]: 고정 필드 순서 JSON을 한 줄씩 기록 (stdout, 파일)
//! - [`TracingSink`]: tracing 이벤트로 요약 기록
//! - [`ChannelSink`]: 임베딩 환경으로 이벤트를 넘기는 bounded mpsc 채널
//! - [`FnSink`]: 클로저 스테이지

use std::fs::{File, OpenOptions};
use std::io::{self, LineWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use sysbeat_core::event::{Event, NodeIdentity};
use tokio::sync::mpsc;
use tracing::info;

use crate::error::CollectorError;

/// 싱크 스테이지
pub trait Sink: Send + Sync {
    /// 스테이지 이름 (로그/메트릭 레이블)
    fn name(&self) -> &str;

    /// 이벤트를 소비합니다.
    fn consume(&self, event: &Event) -> Result<(), CollectorError>;
}

/// JSON Lines 싱크
pub struct JsonLinesSink<W: Write + Send> {
    name: String,
    node: NodeIdentity,
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    /// 임의의 writer로 싱크를 생성합니다.
    pub fn new(name: impl Into<String>, writer: W, node: NodeIdentity) -> Self {
        Self {
            name: name.into(),
            node,
            writer: Mutex::new(writer),
        }
    }

    /// writer를 꺼냅니다.
    pub fn into_inner(self) -> Result<W, CollectorError> {
        self.writer
            .into_inner()
            .map_err(|e| CollectorError::sink(self.name, e.to_string()))
    }
}

impl JsonLinesSink<io::Stdout> {
    /// 표준 출력 싱크를 생성합니다.
    pub fn stdout(node: NodeIdentity) -> Self {
        Self::new("stdout", io::stdout(), node)
    }
}

impl JsonLinesSink<LineWriter<File>> {
    /// 파일 끝에 추가하는 싱크를 생성합니다. 상위 디렉토리가 없으면 만듭니다.
    pub fn file(path: impl AsRef<Path>, node: NodeIdentity) -> Result<Self, CollectorError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(
            format!("file:{}", path.display()),
            LineWriter::new(file),
            node,
        ))
    }
}

impl<W: Write + Send> Sink for JsonLinesSink<W> {
    fn name(&self) -> &str {
        &self.name
    }

    fn consume(&self, event: &Event) -> Result<(), CollectorError> {
        let mut line = event
            .encode_json(&self.node)
            .map_err(|e| CollectorError::sink(&self.name, e.to_string()))?;
        line.push(b'\n');

        let mut writer = self
            .writer
            .lock()
            .map_err(|e| CollectorError::sink(&self.name, e.to_string()))?;
        writer.write_all(&line)?;
        writer.flush()?;
        Ok(())
    }
}

/// tracing 요약 싱크
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TracingSink {
    /// 새 싱크를 생성합니다.
    pub fn new() -> Self {
        Self
    }
}

impl Sink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    fn consume(&self, event: &Event) -> Result<(), CollectorError> {
        match event {
            Event::Log(ev) => info!(
                target: "sysbeat::event",
                collector = %ev.collector,
                channel = %ev.channel,
                event_id = ev.event_id,
                record_id = ev.record_id,
                provider = %ev.provider_name,
                "log event"
            ),
            Event::Dns(tx) => info!(
                target: "sysbeat::event",
                collector = %tx.collector,
                remote = %tx.remote,
                source_port = tx.source_port,
                dns_id = tx.message.header.id,
                question = tx.message.questions.first().map(|q| q.name.as_str()).unwrap_or(""),
                answers = tx.message.answers.len(),
                "dns transaction"
            ),
        }
        Ok(())
    }
}

/// bounded mpsc 채널 싱크
///
/// 채널이 가득 차거나 닫혀 있으면 스테이지 실패로 보고하고 이벤트를 버립니다.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    name: String,
    tx: mpsc::Sender<Event>,
}

impl ChannelSink {
    /// 채널 싱크를 생성합니다.
    pub fn new(name: impl Into<String>, tx: mpsc::Sender<Event>) -> Self {
        Self {
            name: name.into(),
            tx,
        }
    }
}

impl Sink for ChannelSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn consume(&self, event: &Event) -> Result<(), CollectorError> {
        self.tx
            .try_send(event.clone())
            .map_err(|e| CollectorError::sink(&self.name, e.to_string()))
    }
}

/// 클로저 싱크
pub struct FnSink<F> {
    name: String,
    f: F,
}

impl<F> FnSink<F>
where
    F: Fn(&Event) -> Result<(), CollectorError> + Send + Sync,
{
    /// 클로저로 싱크를 생성합니다.
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> Sink for FnSink<F>
where
    F: Fn(&Event) -> Result<(), CollectorError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn consume(&self, event: &Event) -> Result<(), CollectorError> {
        (self.f)(event)
    }
}
