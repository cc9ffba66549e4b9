//! `<EventData>` 추출
//!
//! 이벤트 XML의 `<Data Name='..'>값</Data>` 항목을 문서 순서대로 꺼냅니다.
//! 값이 없는 `<Data Name='..'/>`는 빈 문자열입니다.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::error::CollectorError;

static DATA_PATTERN: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(r#"(?s)<Data\s+Name=['"]([^'"]*)['"]\s*(?:/>|>(.*?)</Data>)"#)
});

/// 이벤트 데이터 항목
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataItem {
    pub name: String,
    pub value: String,
}

/// 이벤트 데이터
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct EventData {
    items: Vec<DataItem>,
}

impl EventData {
    /// 이벤트 XML에서 데이터 항목을 추출합니다.
    pub fn from_xml(xml: &str) -> Result<Self, CollectorError> {
        let pattern = DATA_PATTERN.as_ref().map_err(|e| CollectorError::Decode {
            offset: 0,
            reason: e.to_string(),
        })?;

        let items = pattern
            .captures_iter(xml)
            .map(|caps| DataItem {
                name: unescape(&caps[1]),
                value: caps.get(2).map(|m| unescape(m.as_str())).unwrap_or_default(),
            })
            .collect();
        Ok(Self { items })
    }

    /// 이름으로 첫 번째 값을 찾습니다.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|item| item.name == name)
            .map(|item| item.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &DataItem> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

fn unescape(value: &str) -> String {
    if !value.contains('&') {
        return value.to_owned();
    }
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&apos;", "'")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOGON_XML: &str = "<Event><System><EventID>4624</EventID></System><EventData>\
        <Data Name='SubjectUserSid'>S-1-5-18</Data>\
        <Data Name='TargetUserName'>alice</Data>\
        <Data Name='TargetDomainName'>CORP</Data>\
        <Data Name='IpAddress'>10.1.2.3</Data>\
        <Data Name='IpPort'>51234</Data>\
        <Data Name='Empty'/>\
        </EventData></Event>";

    #[test]
    fn extracts_named_values_in_order() {
        let data = EventData::from_xml(LOGON_XML).unwrap();
        assert_eq!(data.len(), 6);
        assert_eq!(data.get("TargetUserName"), Some("alice"));
        assert_eq!(data.get("IpPort"), Some("51234"));
        assert_eq!(data.get("Empty"), Some(""));
        assert_eq!(data.iter().next().map(|i| i.name.as_str()), Some("SubjectUserSid"));
    }

    #[test]
    fn unescapes_entities() {
        let data =
            EventData::from_xml("<Data Name=\"Cmd\">a &amp;&amp; b &lt;c&gt;</Data>").unwrap();
        assert_eq!(data.get("Cmd"), Some("a && b <c>"));
    }

    #[test]
    fn no_event_data_is_empty() {
        let data = EventData::from_xml("<Event><System/></Event>").unwrap();
        assert!(data.is_empty());
        assert!(data.get("anything").is_none());
    }

    #[test]
    fn serializes_as_list() {
        let data = EventData::from_xml("<Data Name='A'>1</Data>").unwrap();
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json, serde_json::json!([{"name": "A", "value": "1"}]));
    }
}
