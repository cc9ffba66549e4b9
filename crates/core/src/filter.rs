//! 수용 필터 -- 디코딩 전에 평가하는 저비용 허용 목록
//!
//! [`FilterPolicy`]는 단일 값 또는 값 집합으로 구성됩니다.
//! 이벤트 로그 수집기는 이벤트 ID에, DNS 수집기는 UDP 소스 포트에 적용합니다.
//! 평가는 정수 비교만으로 끝나야 하며 페이로드 디코딩을 요구하지 않습니다.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// 허용 정책
///
/// 설정 파일에서는 `pass = 4624` 또는 `pass = [4624, 4625]` 형태로 지정합니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterPolicy {
    /// 단일 값만 허용 (동등 비교)
    Single(u64),
    /// 집합에 포함된 값만 허용. 빈 집합은 아무것도 허용하지 않습니다.
    Set(BTreeSet<u64>),
}

impl FilterPolicy {
    /// 값 목록에서 정책을 생성합니다.
    ///
    /// 값이 하나면 `Single`, 그 외에는 `Set`이 됩니다.
    pub fn from_values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = u64>,
    {
        let set: BTreeSet<u64> = values.into_iter().collect();
        if set.len() == 1 {
            if let Some(only) = set.iter().next() {
                return Self::Single(*only);
            }
        }
        Self::Set(set)
    }

    /// 값이 허용되는지 확인합니다.
    #[inline]
    pub fn admits(&self, value: u64) -> bool {
        match self {
            Self::Single(allowed) => *allowed == value,
            Self::Set(set) => set.contains(&value),
        }
    }

    /// 허용 값 개수를 반환합니다.
    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Set(set) => set.len(),
        }
    }

    /// 허용 값이 하나도 없는지 확인합니다.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
