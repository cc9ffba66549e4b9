//! 채널 구독 관리와 레코드 변환
//!
//! [`Watcher`]는 공유 렌더링 컨텍스트 하나와 채널별 구독(리스너 + 북마크)을 소유합니다.
//! 네이티브 콜백은 레코드를 [`LogEvent`]로 변환해 bounded 큐에 넣습니다.
//!
//! # 레코드 처리 순서
//! 1. 시스템 속성 렌더링 (실패한 필드는 `render_error`에 기록하고 계속)
//! 2. `pass` 필터 (이벤트 ID)
//! 3. 지역화 텍스트 렌더링 (`RenderOptions`에 켜진 필드만)
//! 4. 큐 슬롯 예약. 가득 차 있으면 슬롯이 날 때까지 콜백 스레드에서 기다림
//! 5. 북마크 갱신 후 토큰을 이벤트에 포함
//! 6. 예약한 슬롯으로 전송
//!
//! 레코드는 watcher가 종료되거나 해당 채널 구독이 해제됐을 때, 또는 큐가 닫혔을 때만
//! 버려집니다. 버려진 레코드 뒤로 북마크가 전진하지 않으므로 체크포인트는 전달된
//! 이벤트를 앞지르지 않습니다.
//!
//! 구독 맵 락은 삽입, 제거, 조회에만 잡으며 네이티브 호출 중에는 잡지 않습니다.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use metrics::{counter, gauge};
use sysbeat_core::event::LogEvent;
use sysbeat_core::metrics as m;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info};

use super::native::{EventLogApi, MessageField, OwnedHandle, RawHandle, RecordSink, StartAt};
use crate::config::{RenderOptions, WinlogConfig};
use crate::error::CollectorError;
use crate::supervisor::LiveReceiver;

/// 큐가 가득 찼을 때 슬롯을 다시 확인하는 간격
const QUEUE_WAIT_INTERVAL: Duration = Duration::from_millis(5);

// 필드 선언 순서대로 드롭됩니다. 리스너가 북마크보다 먼저 닫힙니다.
struct Subscription {
    released: Arc<AtomicBool>,
    listener: OwnedHandle,
    bookmark: OwnedHandle,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // 리스너를 닫기 전에 표시해야 큐를 기다리던 콜백이 빠져나옵니다.
        self.released.store(true, Ordering::Release);
    }
}

#[derive(Clone, Copy)]
enum Resume<'a> {
    Oldest,
    Now,
    Bookmark(&'a str),
}

struct WatcherInner {
    api: Arc<dyn EventLogApi>,
    collector: String,
    context: OwnedHandle,
    live: LiveReceiver<WinlogConfig>,
    events: mpsc::Sender<LogEvent>,
    errors: mpsc::Sender<CollectorError>,
    subs: Mutex<BTreeMap<String, Subscription>>,
    closed: AtomicBool,
}

/// 채널 구독 관리자
pub struct Watcher {
    inner: Arc<WatcherInner>,
}

impl Watcher {
    /// 렌더링 컨텍스트를 획득하고 watcher를 생성합니다.
    pub fn open(
        api: Arc<dyn EventLogApi>,
        collector: impl Into<String>,
        live: LiveReceiver<WinlogConfig>,
        events: mpsc::Sender<LogEvent>,
        errors: mpsc::Sender<CollectorError>,
    ) -> Result<Self, CollectorError> {
        let context = api
            .create_render_context()
            .map_err(|e| CollectorError::SourceOpen {
                source_type: "winlog".to_owned(),
                reason: e.to_string(),
            })?;
        let context = OwnedHandle::new(context, Arc::clone(&api));

        Ok(Self {
            inner: Arc::new(WatcherInner {
                api,
                collector: collector.into(),
                context,
                live,
                events,
                errors,
                subs: Mutex::new(BTreeMap::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// 가장 오래된 레코드부터 구독합니다.
    pub fn subscribe_from_beginning(&self, channel: &str, query: &str) -> Result<(), CollectorError> {
        self.subscribe(channel, query, Resume::Oldest)
    }

    /// 북마크 토큰 다음 레코드부터 구독합니다.
    pub fn subscribe_from_bookmark(
        &self,
        channel: &str,
        query: &str,
        token: &str,
    ) -> Result<(), CollectorError> {
        self.subscribe(channel, query, Resume::Bookmark(token))
    }

    /// 이후 도착하는 레코드만 구독합니다.
    pub fn subscribe_from_now(&self, channel: &str, query: &str) -> Result<(), CollectorError> {
        self.subscribe(channel, query, Resume::Now)
    }

    fn subscribe(&self, channel: &str, query: &str, from: Resume<'_>) -> Result<(), CollectorError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(CollectorError::State {
                name: inner.collector.clone(),
                state: "closed",
            });
        }
        if inner.lock_subs().contains_key(channel) {
            return Err(CollectorError::SubscriptionConflict {
                channel: channel.to_owned(),
            });
        }

        let token = match from {
            Resume::Bookmark(token) => Some(token),
            Resume::Oldest | Resume::Now => None,
        };
        let bookmark = OwnedHandle::new(inner.api.create_bookmark(token)?, Arc::clone(&inner.api));
        let start = match from {
            Resume::Oldest => StartAt::Oldest,
            Resume::Now => StartAt::Future,
            Resume::Bookmark(_) => StartAt::AfterBookmark(bookmark.raw()),
        };

        let released = Arc::new(AtomicBool::new(false));
        let callback = Arc::new(ChannelCallback {
            channel: channel.to_owned(),
            bookmark: bookmark.raw(),
            released: Arc::clone(&released),
            inner: Arc::downgrade(inner),
        });
        let listener = match inner.api.subscribe(channel, query, start, callback) {
            Ok(listener) => listener,
            Err(e) => {
                released.store(true, Ordering::Release);
                return Err(e);
            }
        };
        let subscription = Subscription {
            released,
            listener: OwnedHandle::new(listener, Arc::clone(&inner.api)),
            bookmark,
        };

        let count = {
            let mut subs = inner.lock_subs();
            if subs.contains_key(channel) {
                drop(subs);
                drop(subscription);
                return Err(CollectorError::SubscriptionConflict {
                    channel: channel.to_owned(),
                });
            }
            subs.insert(channel.to_owned(), subscription);
            subs.len()
        };
        inner.record_subscriptions(count);
        info!(collector = %inner.collector, channel, "channel subscribed");
        Ok(())
    }

    /// 채널 구독을 해제합니다. 구독이 있었으면 `true`를 반환합니다.
    pub fn remove(&self, channel: &str) -> bool {
        let inner = &self.inner;
        let (removed, count) = {
            let mut subs = inner.lock_subs();
            let removed = subs.remove(channel);
            (removed, subs.len())
        };
        let Some(subscription) = removed else {
            return false;
        };
        drop(subscription);
        inner.record_subscriptions(count);
        info!(collector = %inner.collector, channel, "channel unsubscribed");
        true
    }

    /// 구독 중인 채널 목록 (정렬됨)
    pub fn channels(&self) -> Vec<String> {
        self.inner.lock_subs().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock_subs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock_subs().is_empty()
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.inner.lock_subs().contains_key(channel)
    }

    /// 채널의 (리스너, 북마크) 핸들
    pub fn handles(&self, channel: &str) -> Option<(RawHandle, RawHandle)> {
        self.inner
            .lock_subs()
            .get(channel)
            .map(|s| (s.listener.raw(), s.bookmark.raw()))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// 모든 구독을 해제하고 렌더링 컨텍스트를 닫습니다. 멱등입니다.
    ///
    /// 이후 도착하는 콜백은 아무것도 전송하지 않습니다. 내부 큐는 watcher가
    /// 드롭될 때 닫힙니다.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let subs = std::mem::take(&mut *inner.lock_subs());
        for (channel, subscription) in subs {
            drop(subscription);
            debug!(collector = %inner.collector, channel = %channel, "subscription released");
        }
        inner.record_subscriptions(0);

        if let Err(e) = inner.context.close() {
            debug!(collector = %inner.collector, error = %e, "failed to close render context");
        }
        info!(collector = %inner.collector, "watcher shut down");
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl WatcherInner {
    fn lock_subs(&self) -> MutexGuard<'_, BTreeMap<String, Subscription>> {
        self.subs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_subscriptions(&self, count: usize) {
        gauge!(m::WINLOG_SUBSCRIPTIONS, m::LABEL_COLLECTOR => self.collector.clone())
            .set(count as f64);
    }

    fn is_released(&self, released: &AtomicBool) -> bool {
        self.closed.load(Ordering::Acquire) || released.load(Ordering::Acquire)
    }

    fn publish(&self, channel: &str, bookmark: RawHandle, released: &AtomicBool, record: RawHandle) {
        if self.is_released(released) {
            return;
        }
        let live = self.live.borrow().clone();
        let config = &live.config;

        let mut ev = LogEvent::new(self.collector.as_str(), channel);
        match self.api.render_values(self.context.raw(), record) {
            Ok(values) => {
                let missing = values.apply(&mut ev);
                if !missing.is_empty() {
                    ev.render_error = Some(format!("missing system fields: {}", missing.join(", ")));
                }
            }
            Err(e) => ev.render_error = Some(e.to_string()),
        }
        if ev.render_error.is_some() {
            counter!(m::WINLOG_RENDER_ERRORS_TOTAL, m::LABEL_COLLECTOR => self.collector.clone())
                .increment(1);
        }

        if let Some(pass) = &config.pass {
            if !pass.admits(ev.event_id) {
                counter!(
                    m::WINLOG_ADMISSION_MISSES_TOTAL,
                    m::LABEL_COLLECTOR => self.collector.clone(),
                    m::LABEL_CHANNEL => channel.to_owned()
                )
                .increment(1);
                return;
            }
        }

        if config.render.needs_publisher() {
            self.render_text(&mut ev, record, &config.render);
        }
        if config.render.xml {
            match self.api.render_xml(record) {
                Ok(xml) => ev.xml = xml,
                Err(e) => debug!(collector = %self.collector, channel, error = %e, "xml render failed"),
            }
        }

        let mut waited = false;
        let permit = loop {
            match self.events.try_reserve() {
                Ok(permit) => break permit,
                Err(TrySendError::Full(())) if !self.is_released(released) => {
                    if !waited {
                        debug!(
                            collector = %self.collector,
                            channel,
                            record_id = ev.record_id,
                            "event queue full, waiting for delivery loop"
                        );
                        waited = true;
                    }
                    std::thread::sleep(QUEUE_WAIT_INTERVAL);
                }
                Err(e) => {
                    counter!(
                        m::WINLOG_EVENTS_DROPPED_TOTAL,
                        m::LABEL_COLLECTOR => self.collector.clone(),
                        m::LABEL_CHANNEL => channel.to_owned()
                    )
                    .increment(1);
                    debug!(
                        collector = %self.collector,
                        channel,
                        record_id = ev.record_id,
                        error = %e,
                        "subscription released or queue closed, record dropped"
                    );
                    return;
                }
            }
        };

        if let Err(e) = self.api.update_bookmark(bookmark, record) {
            self.publish_error(e);
            return;
        }
        match self.api.render_bookmark(bookmark) {
            Ok(token) => ev.bookmark = token,
            Err(e) => {
                self.publish_error(e);
                return;
            }
        }

        counter!(
            m::WINLOG_EVENTS_RECEIVED_TOTAL,
            m::LABEL_COLLECTOR => self.collector.clone(),
            m::LABEL_CHANNEL => channel.to_owned()
        )
        .increment(1);
        permit.send(ev);
    }

    fn render_text(&self, ev: &mut LogEvent, record: RawHandle, render: &RenderOptions) {
        let publisher = match self.api.open_publisher(&ev.provider_name) {
            Ok(raw) => OwnedHandle::new(raw, Arc::clone(&self.api)),
            Err(e) => {
                ev.publisher_error = Some(e.to_string());
                return;
            }
        };

        let fields = [
            (render.message, MessageField::Event),
            (render.level, MessageField::Level),
            (render.task, MessageField::Task),
            (render.opcode, MessageField::Opcode),
            (render.keywords, MessageField::Keyword),
            (render.channel, MessageField::Channel),
            (render.provider, MessageField::Provider),
            (render.id, MessageField::Id),
        ];
        for (enabled, field) in fields {
            if !enabled {
                continue;
            }
            let text = match self.api.format_message(publisher.raw(), record, field) {
                Ok(text) => text,
                Err(e) => {
                    ev.publisher_error.get_or_insert_with(|| e.to_string());
                    continue;
                }
            };
            match field {
                MessageField::Event => ev.message = text,
                MessageField::Level => ev.level_text = text,
                MessageField::Task => ev.task_text = text,
                MessageField::Opcode => ev.opcode_text = text,
                MessageField::Keyword => {
                    ev.keywords = text
                        .split('\0')
                        .filter(|k| !k.is_empty())
                        .map(str::to_owned)
                        .collect();
                }
                MessageField::Channel => ev.channel_text = text,
                MessageField::Provider => ev.provider_text = text,
                MessageField::Id => ev.id_text = text,
            }
        }
    }

    fn publish_error(&self, error: CollectorError) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.errors.try_send(error) {
            debug!(collector = %self.collector, error = %e, "error queue unavailable");
        }
    }
}

struct ChannelCallback {
    channel: String,
    bookmark: RawHandle,
    released: Arc<AtomicBool>,
    inner: Weak<WatcherInner>,
}

impl RecordSink for ChannelCallback {
    fn deliver(&self, record: RawHandle) {
        if let Some(inner) = self.inner.upgrade() {
            inner.publish(&self.channel, self.bookmark, &self.released, record);
        }
    }

    fn fail(&self, error: CollectorError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.publish_error(error);
        }
    }
}
