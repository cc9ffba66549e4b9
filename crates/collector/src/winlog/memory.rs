//! 메모리 이벤트 로그
//!
//! [`EventLogApi`]의 프로세스 내 구현입니다. 채널별 레코드 목록을 보관하고,
//! [`MemoryEventLog::append`]로 추가된 레코드를 활성 구독에 전달합니다.
//! 테스트와 재생, 네이티브 API가 없는 플랫폼에서의 임베딩에 사용합니다.
//!
//! 네이티브 API처럼 콜백은 호출자 스레드가 아닌 구독별 전달 스레드에서 실행됩니다.
//! 구독 핸들을 닫으면 진행 중인 콜백이 끝날 때까지 기다립니다.
//!
//! 북마크 토큰 형식은 wevtapi와 같습니다.
//! ```text
//! <BookmarkList>
//!   <Bookmark Channel='Security' RecordId='42' IsCurrent='true'/>
//! </BookmarkList>
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;

use super::native::{EventLogApi, MessageField, RawHandle, RecordSink, StartAt, SystemValues};
use crate::error::CollectorError;

static BOOKMARK_PATTERN: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(r#"<Bookmark\s+Channel=['"]([^'"]*)['"]\s+RecordId=['"](\d+)['"]"#)
});

/// 메모리 로그에 추가할 레코드
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRecord {
    pub provider_name: String,
    pub event_id: u64,
    pub qualifiers: u64,
    pub level: u64,
    pub task: u64,
    pub opcode: u64,
    pub version: u64,
    pub process_id: u64,
    pub thread_id: u64,
    pub computer: String,
    pub created: DateTime<Utc>,
    pub message: String,
    pub task_text: String,
    pub keywords: Vec<String>,
    /// `<EventData>`의 `(Name, 값)` 목록
    pub data: Vec<(String, String)>,
}

impl MemoryRecord {
    /// 게시자와 이벤트 ID로 레코드를 생성합니다.
    pub fn new(provider_name: impl Into<String>, event_id: u64) -> Self {
        Self {
            provider_name: provider_name.into(),
            event_id,
            qualifiers: 0,
            level: 4,
            task: 0,
            opcode: 0,
            version: 0,
            process_id: 4,
            thread_id: 8,
            computer: "localhost".to_owned(),
            created: Utc::now(),
            message: String::new(),
            task_text: String::new(),
            keywords: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_level(mut self, level: u64) -> Self {
        self.level = level;
        self
    }

    pub fn with_task(mut self, task: u64, text: impl Into<String>) -> Self {
        self.task = task;
        self.task_text = text.into();
        self
    }

    pub fn with_keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keywords.push(keyword.into());
        self
    }

    pub fn with_computer(mut self, computer: impl Into<String>) -> Self {
        self.computer = computer.into();
        self
    }

    pub fn with_created(mut self, created: DateTime<Utc>) -> Self {
        self.created = created;
        self
    }

    /// `<Data Name=...>` 항목을 추가합니다.
    pub fn with_data(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
struct StoredRecord {
    channel: String,
    record_id: u64,
    record: MemoryRecord,
}

impl StoredRecord {
    fn values(&self) -> SystemValues {
        SystemValues {
            provider_name: Some(self.record.provider_name.clone()),
            event_id: Some(self.record.event_id),
            qualifiers: Some(self.record.qualifiers),
            level: Some(self.record.level),
            task: Some(self.record.task),
            opcode: Some(self.record.opcode),
            created: Some(self.record.created),
            record_id: Some(self.record_id),
            process_id: Some(self.record.process_id),
            thread_id: Some(self.record.thread_id),
            channel: Some(self.channel.clone()),
            computer: Some(self.record.computer.clone()),
            version: Some(self.record.version),
        }
    }

    fn xml(&self) -> String {
        let r = &self.record;
        let mut xml = String::with_capacity(512);
        xml.push_str("<Event xmlns='http://schemas.microsoft.com/win/2004/08/events/event'><System>");
        let _ = write!(
            xml,
            "<Provider Name='{}'/><EventID>{}</EventID><Version>{}</Version><Level>{}</Level>\
             <Task>{}</Task><Opcode>{}</Opcode><TimeCreated SystemTime='{}'/>\
             <EventRecordID>{}</EventRecordID><Execution ProcessID='{}' ThreadID='{}'/>\
             <Channel>{}</Channel><Computer>{}</Computer>",
            escape(&r.provider_name),
            r.event_id,
            r.version,
            r.level,
            r.task,
            r.opcode,
            r.created.to_rfc3339_opts(SecondsFormat::Nanos, true),
            self.record_id,
            r.process_id,
            r.thread_id,
            escape(&self.channel),
            escape(&r.computer),
        );
        xml.push_str("</System><EventData>");
        for (name, value) in &r.data {
            let _ = write!(xml, "<Data Name='{}'>{}</Data>", escape(name), escape(value));
        }
        xml.push_str("</EventData></Event>");
        xml
    }
}

enum HandleKind {
    RenderContext,
    Bookmark { position: Option<(String, u64)> },
    Subscription {
        channel: String,
        feed: std_mpsc::Sender<RawHandle>,
        worker: Option<JoinHandle<()>>,
    },
    Record { channel: String, index: usize },
    Publisher,
}

#[derive(Default)]
struct Failures {
    render_context: bool,
    publisher: bool,
    subscribe: HashSet<String>,
    omitted_fields: Vec<String>,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    handles: HashMap<u64, HandleKind>,
    channels: HashMap<String, Vec<StoredRecord>>,
    failures: Failures,
}

impl State {
    fn allocate(&mut self, kind: HandleKind) -> RawHandle {
        self.next_handle += 1;
        self.handles.insert(self.next_handle, kind);
        RawHandle(self.next_handle)
    }

    fn record(&self, handle: RawHandle) -> Result<&StoredRecord, CollectorError> {
        match self.handles.get(&handle.0) {
            Some(HandleKind::Record { channel, index }) => self
                .channels
                .get(channel)
                .and_then(|records| records.get(*index))
                .ok_or_else(|| invalid("record", handle)),
            _ => Err(invalid("record", handle)),
        }
    }
}

fn lock_state(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 구독별 전달 스레드를 시작합니다.
///
/// 피드로 받은 레코드 핸들을 순서대로 전달하고, 전달이 끝나면 핸들을 해제합니다.
/// 피드의 송신 측이 모두 드롭되면 남은 레코드를 비우고 종료합니다.
fn spawn_delivery(
    state: Weak<Mutex<State>>,
    channel: &str,
    sink: Arc<dyn RecordSink>,
    feed: std_mpsc::Receiver<RawHandle>,
) -> Result<JoinHandle<()>, CollectorError> {
    thread::Builder::new()
        .name(format!("memlog-{channel}"))
        .spawn(move || {
            for record in feed {
                sink.deliver(record);
                if let Some(state) = state.upgrade() {
                    lock_state(&state).handles.remove(&record.0);
                }
            }
        })
        .map_err(|e| CollectorError::native("EvtSubscribe", e.to_string()))
}

/// 메모리 이벤트 로그
#[derive(Default)]
pub struct MemoryEventLog {
    state: Arc<Mutex<State>>,
}

impl MemoryEventLog {
    /// 빈 이벤트 로그를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        lock_state(&self.state)
    }

    /// 채널에 레코드를 추가하고 활성 구독의 전달 큐에 넣습니다. 레코드 ID를 반환합니다.
    ///
    /// 전달은 비동기입니다. 반환 시점에 콜백이 끝났다는 보장은 없습니다.
    pub fn append(&self, channel: &str, record: MemoryRecord) -> u64 {
        let mut state = self.lock();
        let records = state.channels.entry(channel.to_owned()).or_default();
        let record_id = records.len() as u64 + 1;
        let index = records.len();
        records.push(StoredRecord {
            channel: channel.to_owned(),
            record_id,
            record,
        });

        let feeds: Vec<std_mpsc::Sender<RawHandle>> = state
            .handles
            .values()
            .filter_map(|kind| match kind {
                HandleKind::Subscription { channel: c, feed, .. } if c == channel => {
                    Some(feed.clone())
                }
                _ => None,
            })
            .collect();
        for feed in feeds {
            let handle = state.allocate(HandleKind::Record {
                channel: channel.to_owned(),
                index,
            });
            if feed.send(handle).is_err() {
                state.handles.remove(&handle.0);
            }
        }
        record_id
    }

    /// 렌더링 컨텍스트 생성을 실패시킵니다.
    pub fn fail_render_context(&self, fail: bool) {
        self.lock().failures.render_context = fail;
    }

    /// 게시자 메타데이터 열기를 실패시킵니다.
    pub fn fail_publisher(&self, fail: bool) {
        self.lock().failures.publisher = fail;
    }

    /// 채널 구독을 실패시킵니다.
    pub fn fail_subscribe(&self, channel: &str, fail: bool) {
        let mut state = self.lock();
        if fail {
            state.failures.subscribe.insert(channel.to_owned());
        } else {
            state.failures.subscribe.remove(channel);
        }
    }

    /// 시스템 속성 렌더링에서 지정한 필드를 비웁니다.
    pub fn omit_field(&self, name: &str) {
        self.lock().failures.omitted_fields.push(name.to_owned());
    }

    /// 레코드 핸들을 제외한 열린 핸들 수
    pub fn open_handle_count(&self) -> usize {
        self.lock()
            .handles
            .values()
            .filter(|kind| !matches!(kind, HandleKind::Record { .. }))
            .count()
    }

    /// 핸들이 열려 있는지 확인합니다.
    pub fn is_open(&self, handle: RawHandle) -> bool {
        self.lock().handles.contains_key(&handle.0)
    }

    /// 채널의 활성 구독 수
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.lock()
            .handles
            .values()
            .filter(|kind| matches!(kind, HandleKind::Subscription { channel: c, .. } if c == channel))
            .count()
    }

    /// 채널에 저장된 레코드 수
    pub fn record_count(&self, channel: &str) -> usize {
        self.lock().channels.get(channel).map_or(0, Vec::len)
    }

    /// 북마크 토큰을 생성합니다.
    pub fn bookmark_token(channel: &str, record_id: u64) -> String {
        format!(
            "<BookmarkList>\r\n  <Bookmark Channel='{}' RecordId='{record_id}' IsCurrent='true'/>\r\n</BookmarkList>",
            escape(channel)
        )
    }
}

impl EventLogApi for MemoryEventLog {
    fn create_render_context(&self) -> Result<RawHandle, CollectorError> {
        let mut state = self.lock();
        if state.failures.render_context {
            return Err(CollectorError::native("EvtCreateRenderContext", "injected failure"));
        }
        Ok(state.allocate(HandleKind::RenderContext))
    }

    fn create_bookmark(&self, xml: Option<&str>) -> Result<RawHandle, CollectorError> {
        let position = match xml {
            None => None,
            Some(xml) => parse_bookmark(xml)?,
        };
        Ok(self.lock().allocate(HandleKind::Bookmark { position }))
    }

    fn subscribe(
        &self,
        channel: &str,
        _query: &str,
        start: StartAt,
        sink: Arc<dyn RecordSink>,
    ) -> Result<RawHandle, CollectorError> {
        let (feed, queue) = std_mpsc::channel();
        let worker = spawn_delivery(Arc::downgrade(&self.state), channel, sink, queue)?;

        let mut state = self.lock();
        if state.failures.subscribe.contains(channel) {
            return Err(CollectorError::native(
                "EvtSubscribe",
                format!("channel '{channel}' is not available"),
            ));
        }

        let after = match start {
            StartAt::Oldest => Some(0),
            StartAt::Future => None,
            StartAt::AfterBookmark(bookmark) => match state.handles.get(&bookmark.0) {
                Some(HandleKind::Bookmark { position: None }) => Some(0),
                Some(HandleKind::Bookmark {
                    position: Some((c, record_id)),
                }) if c == channel => Some(*record_id),
                Some(HandleKind::Bookmark { .. }) => {
                    return Err(CollectorError::native(
                        "EvtSubscribe",
                        format!("bookmark does not belong to channel '{channel}'"),
                    ));
                }
                _ => return Err(invalid("bookmark", bookmark)),
            },
        };

        let indexes: Vec<usize> = match (after, state.channels.get(channel)) {
            (Some(after), Some(records)) => records
                .iter()
                .enumerate()
                .filter(|(_, r)| r.record_id > after)
                .map(|(i, _)| i)
                .collect(),
            _ => Vec::new(),
        };
        for index in indexes {
            let handle = state.allocate(HandleKind::Record {
                channel: channel.to_owned(),
                index,
            });
            if feed.send(handle).is_err() {
                state.handles.remove(&handle.0);
            }
        }

        Ok(state.allocate(HandleKind::Subscription {
            channel: channel.to_owned(),
            feed,
            worker: Some(worker),
        }))
    }

    fn render_values(
        &self,
        context: RawHandle,
        record: RawHandle,
    ) -> Result<SystemValues, CollectorError> {
        let state = self.lock();
        if !matches!(state.handles.get(&context.0), Some(HandleKind::RenderContext)) {
            return Err(invalid("render context", context));
        }
        let mut values = state.record(record)?.values();
        for name in &state.failures.omitted_fields {
            values.clear(name);
        }
        Ok(values)
    }

    fn render_xml(&self, record: RawHandle) -> Result<String, CollectorError> {
        Ok(self.lock().record(record)?.xml())
    }

    fn update_bookmark(
        &self,
        bookmark: RawHandle,
        record: RawHandle,
    ) -> Result<(), CollectorError> {
        let mut state = self.lock();
        let (channel, record_id) = {
            let stored = state.record(record)?;
            (stored.channel.clone(), stored.record_id)
        };
        match state.handles.get_mut(&bookmark.0) {
            Some(HandleKind::Bookmark { position }) => {
                *position = Some((channel, record_id));
                Ok(())
            }
            _ => Err(invalid("bookmark", bookmark)),
        }
    }

    fn render_bookmark(&self, bookmark: RawHandle) -> Result<String, CollectorError> {
        match self.lock().handles.get(&bookmark.0) {
            Some(HandleKind::Bookmark {
                position: Some((channel, record_id)),
            }) => Ok(Self::bookmark_token(channel, *record_id)),
            Some(HandleKind::Bookmark { position: None }) => {
                Ok("<BookmarkList>\r\n</BookmarkList>".to_owned())
            }
            _ => Err(invalid("bookmark", bookmark)),
        }
    }

    fn open_publisher(&self, provider: &str) -> Result<RawHandle, CollectorError> {
        let mut state = self.lock();
        if state.failures.publisher {
            return Err(CollectorError::native(
                "EvtOpenPublisherMetadata",
                format!("publisher '{provider}' not found"),
            ));
        }
        Ok(state.allocate(HandleKind::Publisher))
    }

    fn format_message(
        &self,
        publisher: RawHandle,
        record: RawHandle,
        field: MessageField,
    ) -> Result<String, CollectorError> {
        let state = self.lock();
        if !matches!(state.handles.get(&publisher.0), Some(HandleKind::Publisher)) {
            return Err(invalid("publisher", publisher));
        }
        let stored = state.record(record)?;
        let r = &stored.record;
        let text = match field {
            MessageField::Event => r.message.clone(),
            MessageField::Level => level_name(r.level).to_owned(),
            MessageField::Task => r.task_text.clone(),
            MessageField::Opcode => "Info".to_owned(),
            MessageField::Keyword => r.keywords.join("\0"),
            MessageField::Channel => stored.channel.clone(),
            MessageField::Provider => r.provider_name.clone(),
            MessageField::Id => r.event_id.to_string(),
        };
        Ok(text)
    }

    fn close(&self, handle: RawHandle) -> Result<(), CollectorError> {
        let removed = self
            .lock()
            .handles
            .remove(&handle.0)
            .ok_or_else(|| invalid("handle", handle))?;

        if let HandleKind::Subscription { feed, worker, .. } = removed {
            drop(feed);
            if let Some(worker) = worker {
                if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                    return Err(CollectorError::native(
                        "EvtClose",
                        format!("delivery thread for {handle} panicked"),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn parse_bookmark(xml: &str) -> Result<Option<(String, u64)>, CollectorError> {
    if !xml.contains("<BookmarkList") {
        return Err(CollectorError::native("EvtCreateBookmark", "not a bookmark list"));
    }
    let pattern = BOOKMARK_PATTERN
        .as_ref()
        .map_err(|e| CollectorError::native("EvtCreateBookmark", e.to_string()))?;
    let Some(caps) = pattern.captures(xml) else {
        return Ok(None);
    };
    let record_id = caps[2]
        .parse::<u64>()
        .map_err(|e| CollectorError::native("EvtCreateBookmark", e.to_string()))?;
    Ok(Some((caps[1].to_owned(), record_id)))
}

fn level_name(level: u64) -> &'static str {
    match level {
        1 => "Critical",
        2 => "Error",
        3 => "Warning",
        5 => "Verbose",
        _ => "Information",
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

fn invalid(what: &str, handle: RawHandle) -> CollectorError {
    CollectorError::native("EvtHandle", format!("invalid {what} handle {handle}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Collect {
        seen: Mutex<Vec<RawHandle>>,
        delay: Option<Duration>,
    }

    impl Collect {
        fn count(&self) -> usize {
            self.seen.lock().unwrap().len()
        }

        fn wait_for(&self, n: usize) {
            let deadline = Instant::now() + Duration::from_secs(2);
            while self.count() < n {
                assert!(Instant::now() < deadline, "only {} of {n} records delivered", self.count());
                thread::sleep(Duration::from_millis(5));
            }
        }
    }

    impl RecordSink for Collect {
        fn deliver(&self, record: RawHandle) {
            if let Some(delay) = self.delay {
                thread::sleep(delay);
            }
            self.seen.lock().unwrap().push(record);
        }

        fn fail(&self, _error: CollectorError) {}
    }

    #[test]
    fn subscribe_oldest_replays_backlog() {
        let log = MemoryEventLog::new();
        log.append("System", MemoryRecord::new("Service Control Manager", 7036));
        log.append("System", MemoryRecord::new("Service Control Manager", 7040));

        let sink = Arc::new(Collect::default());
        let sub = log
            .subscribe("System", "*", StartAt::Oldest, sink.clone())
            .unwrap();
        sink.wait_for(2);

        log.append("System", MemoryRecord::new("Service Control Manager", 7045));
        sink.wait_for(3);
        assert_eq!(log.open_handle_count(), 1);

        log.close(sub).unwrap();
        assert_eq!(sink.count(), 3);
    }

    #[test]
    fn subscribe_future_skips_backlog() {
        let log = MemoryEventLog::new();
        log.append("System", MemoryRecord::new("p", 1));

        let sink = Arc::new(Collect::default());
        let sub = log
            .subscribe("System", "*", StartAt::Future, sink.clone())
            .unwrap();
        log.close(sub).unwrap();
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn callbacks_run_off_the_subscribing_thread() {
        let log = MemoryEventLog::new();
        log.append("System", MemoryRecord::new("p", 1));

        struct ThreadProbe(Mutex<Option<thread::ThreadId>>);
        impl RecordSink for ThreadProbe {
            fn deliver(&self, _record: RawHandle) {
                *self.0.lock().unwrap() = Some(thread::current().id());
            }
            fn fail(&self, _error: CollectorError) {}
        }

        let sink = Arc::new(ThreadProbe(Mutex::new(None)));
        let sub = log
            .subscribe("System", "*", StartAt::Oldest, sink.clone())
            .unwrap();
        log.close(sub).unwrap();

        let delivered_on = sink.0.lock().unwrap().expect("backlog delivered before close returns");
        assert_ne!(delivered_on, thread::current().id());
    }

    #[test]
    fn close_waits_for_queued_callbacks() {
        let log = MemoryEventLog::new();
        let sink = Arc::new(Collect {
            delay: Some(Duration::from_millis(20)),
            ..Collect::default()
        });
        let sub = log
            .subscribe("Application", "*", StartAt::Future, sink.clone())
            .unwrap();
        for id in 0..3 {
            log.append("Application", MemoryRecord::new("p", id));
        }

        log.close(sub).unwrap();
        assert_eq!(sink.count(), 3);
        assert!(log.lock().handles.is_empty());
    }

    #[test]
    fn bookmark_round_trips_through_token() {
        let log = MemoryEventLog::new();
        let token = MemoryEventLog::bookmark_token("Security", 3);
        let bookmark = log.create_bookmark(Some(&token)).unwrap();
        assert_eq!(log.render_bookmark(bookmark).unwrap(), token);
    }

    #[test]
    fn garbage_bookmark_is_rejected() {
        let log = MemoryEventLog::new();
        assert!(log.create_bookmark(Some("not xml at all")).is_err());
    }

    #[test]
    fn bookmark_for_other_channel_is_rejected() {
        let log = MemoryEventLog::new();
        let bookmark = log
            .create_bookmark(Some(&MemoryEventLog::bookmark_token("Application", 1)))
            .unwrap();
        let sink = Arc::new(Collect::default());
        assert!(
            log.subscribe("Security", "*", StartAt::AfterBookmark(bookmark), sink)
                .is_err()
        );
    }

    #[test]
    fn close_twice_fails_second_time() {
        let log = MemoryEventLog::new();
        let ctx = log.create_render_context().unwrap();
        log.close(ctx).unwrap();
        assert!(log.close(ctx).is_err());
    }

    #[test]
    fn xml_escapes_data_values() {
        let stored = StoredRecord {
            channel: "Security".to_owned(),
            record_id: 1,
            record: MemoryRecord::new("p", 4624).with_data("TargetUserName", "a<b"),
        };
        assert!(stored.xml().contains("<Data Name='TargetUserName'>a&lt;b</Data>"));
    }
}
