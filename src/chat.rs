//! Render-ready chat view state and live message fan-out

use crate::models::ChatMessage;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

/// Seconds of silence after which a run of messages from the same
/// sender still gets a fresh name header.
const HEADER_GAP_SECS: i64 = 150;

// ============================================================================
// Chat view
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEntryKind {
    /// Sender name header shown above a run of messages.
    Header,
    /// One wrapped line of a message body.
    Line(String),
}

/// One renderable row. Every row points back at its origin message so
/// hover/selection/context menus can resolve the full message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEntry {
    pub kind: ChatEntryKind,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Chronological message buffer plus the derived entry list a widget
/// renders. Ingestion keeps both sorted ascending by timestamp and is
/// idempotent under duplicate and out-of-order delivery.
pub struct ChatView {
    wrap_width: usize,
    viewport: usize,
    messages: Vec<ChatMessage>,
    entries: Vec<ChatEntry>,
    scroll: usize,
}

impl ChatView {
    pub fn new(wrap_width: usize, viewport: usize) -> Self {
        Self {
            wrap_width,
            viewport,
            messages: Vec::new(),
            entries: Vec::new(),
            scroll: 0,
        }
    }

    pub fn with_history(
        wrap_width: usize,
        viewport: usize,
        history: impl IntoIterator<Item = ChatMessage>,
    ) -> Self {
        let mut view = Self::new(wrap_width, viewport);
        view.ingest_batch(history);
        view.scroll_to_bottom();
        view
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    /// Insert one message. A name header appears before it when it is
    /// the first message, the sender or display name changed, or more
    /// than 150 seconds passed since the previous message. The view
    /// stays pinned to the bottom when it was there before.
    pub fn ingest(&mut self, message: ChatMessage) {
        let pinned = self.at_bottom();
        if self.insert_message(message) {
            self.rebuild_entries();
            self.restore_scroll(pinned);
        }
    }

    /// Insert a batch, e.g. a page of history. The derived entry list
    /// is rebuilt once for the whole batch.
    pub fn ingest_batch(&mut self, messages: impl IntoIterator<Item = ChatMessage>) {
        let pinned = self.at_bottom();
        let mut inserted = false;
        for message in messages {
            inserted |= self.insert_message(message);
        }
        if inserted {
            self.rebuild_entries();
            self.restore_scroll(pinned);
        }
    }

    fn insert_message(&mut self, message: ChatMessage) -> bool {
        if self.messages.iter().any(|m| m.id == message.id) {
            return false;
        }
        let position = self
            .messages
            .partition_point(|m| m.timestamp <= message.timestamp);
        self.messages.insert(position, message);
        true
    }

    fn restore_scroll(&mut self, pinned: bool) {
        if pinned {
            self.scroll_to_bottom();
        } else {
            self.scroll = self.scroll.min(self.max_scroll());
        }
    }

    // The grouping decision depends on each message's chronological
    // predecessor, so entries are derived from the sorted buffer; this
    // keeps them correct when history pages arrive after live traffic.
    fn rebuild_entries(&mut self) {
        self.entries.clear();
        let mut previous: Option<&ChatMessage> = None;
        for message in &self.messages {
            let needs_header = match previous {
                None => true,
                Some(prev) => {
                    prev.sender != message.sender
                        || prev.sender_display_name != message.sender_display_name
                        || message.timestamp.timestamp() - prev.timestamp.timestamp()
                            > HEADER_GAP_SECS
                }
            };
            if needs_header {
                self.entries.push(ChatEntry {
                    kind: ChatEntryKind::Header,
                    message_id: message.id.clone(),
                    timestamp: message.timestamp,
                });
            }
            for line in wrap_lines(&message.content, self.wrap_width) {
                self.entries.push(ChatEntry {
                    kind: ChatEntryKind::Line(line),
                    message_id: message.id.clone(),
                    timestamp: message.timestamp,
                });
            }
            previous = Some(message);
        }
    }

    // ------------------------------------------------------------------
    // Scrolling
    // ------------------------------------------------------------------

    fn max_scroll(&self) -> usize {
        self.entries.len().saturating_sub(self.viewport)
    }

    pub fn at_bottom(&self) -> bool {
        self.scroll >= self.max_scroll()
    }

    pub fn scroll_to_bottom(&mut self) {
        self.scroll = self.max_scroll();
    }

    pub fn scroll_offset(&self) -> usize {
        self.scroll
    }

    /// Scroll upwards; true means the view ran past the top and older
    /// history should be fetched.
    pub fn scroll_up(&mut self, lines: usize) -> bool {
        if self.scroll == 0 {
            return true;
        }
        self.scroll = self.scroll.saturating_sub(lines);
        false
    }

    pub fn scroll_down(&mut self, lines: usize) {
        self.scroll = (self.scroll + lines).min(self.max_scroll());
    }

    /// Pagination cursor: everything strictly older than this is not
    /// loaded yet. `None` when no messages are loaded.
    pub fn oldest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.messages.first().map(|m| m.timestamp)
    }
}

/// Word-wrap to `width` columns; words longer than a full line are
/// broken hard. Every message yields at least one line.
fn wrap_lines(content: &str, width: usize) -> Vec<String> {
    let width = width.max(1);
    let mut lines = Vec::new();
    for paragraph in content.split('\n') {
        let mut line = String::new();
        let mut count = 0usize;
        for word in paragraph.split_whitespace() {
            let word_len = word.chars().count();
            if count > 0 && count + 1 + word_len > width {
                lines.push(std::mem::take(&mut line));
                count = 0;
            }
            if word_len > width {
                for ch in word.chars() {
                    if count == width {
                        lines.push(std::mem::take(&mut line));
                        count = 0;
                    }
                    line.push(ch);
                    count += 1;
                }
            } else {
                if count > 0 {
                    line.push(' ');
                    count += 1;
                }
                line.push_str(word);
                count += word_len;
            }
        }
        if !line.is_empty() || paragraph.trim().is_empty() {
            lines.push(line);
        }
    }
    if lines.is_empty() {
        lines.push(String::new());
    }
    lines
}

// ============================================================================
// Live message fan-out
// ============================================================================

type MessageConsumer = Box<dyn Fn(&ChatMessage) + Send + Sync>;
type BatchConsumer = Box<dyn Fn(&[ChatMessage]) + Send + Sync>;
type NotificationFilter = Box<dyn Fn(&ChatMessage) -> bool + Send + Sync>;

struct ActiveSubscription {
    id: u64,
    message: MessageConsumer,
    batch: BatchConsumer,
    notifications: NotificationFilter,
}

#[derive(Default)]
struct DispatchState {
    next_id: u64,
    active: Option<ActiveSubscription>,
}

/// Fan-out point for live chat traffic. An open chat screen subscribes
/// with its callbacks and holds the returned handle; dropping the
/// handle restores the no-op defaults, so responses arriving after
/// teardown reach nothing.
#[derive(Clone, Default)]
pub struct ChatDispatcher {
    state: Arc<Mutex<DispatchState>>,
}

impl ChatDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        message: impl Fn(&ChatMessage) + Send + Sync + 'static,
        batch: impl Fn(&[ChatMessage]) + Send + Sync + 'static,
        notifications: impl Fn(&ChatMessage) -> bool + Send + Sync + 'static,
    ) -> ChatSubscription {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.active = Some(ActiveSubscription {
            id,
            message: Box::new(message),
            batch: Box::new(batch),
            notifications: Box::new(notifications),
        });
        ChatSubscription {
            state: Arc::clone(&self.state),
            id,
        }
    }

    /// Deliver one live message; returns whether a notification should
    /// be shown for it (always when no view is open).
    pub fn deliver(&self, message: &ChatMessage) -> bool {
        let state = self.state.lock();
        match state.active.as_ref() {
            Some(subscription) => {
                (subscription.message)(message);
                (subscription.notifications)(message)
            }
            None => true,
        }
    }

    /// Deliver a history page.
    pub fn deliver_batch(&self, messages: &[ChatMessage]) {
        let state = self.state.lock();
        if let Some(subscription) = state.active.as_ref() {
            (subscription.batch)(messages);
        }
    }
}

/// Disposable subscription handle; dropping it unsubscribes.
pub struct ChatSubscription {
    state: Arc<Mutex<DispatchState>>,
    id: u64,
}

impl ChatSubscription {
    pub fn unsubscribe(self) {}
}

impl Drop for ChatSubscription {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        // a newer subscription may have replaced this one already
        if state.active.as_ref().map(|s| s.id) == Some(self.id) {
            state.active = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{test_user, ChatMessage};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn message(id: &str, sender: &str, at: i64) -> ChatMessage {
        let hex: String = sender.bytes().map(|b| format!("{b:02x}")).collect();
        let sender = test_user(&format!("{hex:0<32}"), sender);
        ChatMessage {
            id: id.to_string(),
            channel_id: "ch".to_string(),
            sender_display_name: sender.name.clone(),
            sender,
            content: "hello there".to_string(),
            timestamp: Utc.timestamp_opt(at, 0).unwrap(),
        }
    }

    fn headers(view: &ChatView) -> Vec<&str> {
        view.entries()
            .iter()
            .filter(|e| e.kind == ChatEntryKind::Header)
            .map(|e| e.message_id.as_str())
            .collect()
    }

    #[test]
    fn header_grouping_rules() {
        let mut view = ChatView::new(80, 10);
        view.ingest(message("m1", "alice", 0));
        view.ingest(message("m2", "alice", 10));
        view.ingest(message("m3", "alice", 200));
        view.ingest(message("m4", "bob", 201));

        // headers before the first message, after the >150s gap and on
        // the sender change; none between back-to-back same-sender ones
        assert_eq!(headers(&view), vec!["m1", "m3", "m4"]);
    }

    #[test]
    fn display_name_change_forces_header() {
        let mut view = ChatView::new(80, 10);
        view.ingest(message("m1", "alice", 0));
        let mut proxied = message("m2", "alice", 5);
        proxied.sender_display_name = "Alice (proxy)".to_string();
        view.ingest(proxied);
        assert_eq!(headers(&view), vec!["m1", "m2"]);
    }

    #[test]
    fn out_of_order_ingestion_merges() {
        let mut live = ChatView::new(80, 10);
        live.ingest(message("m3", "alice", 300));
        live.ingest(message("m4", "bob", 310));
        // an older history page arrives after live messages
        live.ingest_batch([message("m1", "alice", 0), message("m2", "alice", 10)]);

        let ids: Vec<&str> = live.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3", "m4"]);
        assert_eq!(headers(&live), vec!["m1", "m3", "m4"]);
    }

    #[test]
    fn duplicate_delivery_is_idempotent() {
        let mut view = ChatView::new(80, 10);
        let batch = [message("m1", "alice", 0), message("m2", "alice", 10)];
        view.ingest_batch(batch.clone());
        let entries_before = view.entries().to_vec();
        view.ingest_batch(batch);
        assert_eq!(view.entries(), entries_before.as_slice());
        assert_eq!(view.messages().len(), 2);
    }

    #[test]
    fn bottom_pinning_and_scroll_preservation() {
        let mut view = ChatView::new(80, 3);
        for i in 0..6 {
            view.ingest(message(&format!("m{i}"), "alice", i * 10));
        }
        assert!(view.at_bottom());
        let pinned_at = view.scroll_offset();
        view.ingest(message("m9", "alice", 100));
        // still pinned after insertion
        assert!(view.at_bottom());
        assert!(view.scroll_offset() >= pinned_at);

        view.scroll_up(2);
        assert!(!view.at_bottom());
        let offset = view.scroll_offset();
        view.ingest(message("m10", "alice", 110));
        assert_eq!(view.scroll_offset(), offset);
        assert!(!view.at_bottom());
    }

    #[test]
    fn scrolling_past_top_requests_history() {
        let mut view = ChatView::new(80, 3);
        view.ingest(message("m1", "alice", 0));
        view.scroll_to_bottom();
        while !view.scroll_up(1) {}
        assert_eq!(view.scroll_offset(), 0);
        assert_eq!(
            view.oldest_timestamp(),
            Some(Utc.timestamp_opt(0, 0).unwrap())
        );
    }

    #[test]
    fn wrapping_tags_lines_with_origin() {
        let mut view = ChatView::new(8, 10);
        let mut long = message("m1", "alice", 0);
        long.content = "one two three four".to_string();
        view.ingest(long);
        let lines: Vec<&ChatEntry> = view
            .entries()
            .iter()
            .filter(|e| matches!(e.kind, ChatEntryKind::Line(_)))
            .collect();
        assert!(lines.len() > 1);
        assert!(lines.iter().all(|e| e.message_id == "m1"));
    }

    #[test]
    fn wrap_lines_breaks_words_and_keeps_empty_messages() {
        assert_eq!(wrap_lines("one two three", 7), vec!["one two", "three"]);
        assert_eq!(wrap_lines("abcdefghij", 4), vec!["abcd", "efgh", "ij"]);
        assert_eq!(wrap_lines("", 10), vec![""]);
    }

    #[test]
    fn subscription_drop_restores_noop() {
        let dispatcher = ChatDispatcher::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_cb = Arc::clone(&seen);
        let subscription = dispatcher.subscribe(
            move |_| {
                seen_in_cb.fetch_add(1, Ordering::SeqCst);
            },
            |_| {},
            |_| false,
        );

        // while subscribed: consumed, notification suppressed
        assert!(!dispatcher.deliver(&message("m1", "alice", 0)));
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        drop(subscription);
        // afterwards: nothing reaches the old callbacks, notify again
        assert!(dispatcher.deliver(&message("m2", "alice", 1)));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn newer_subscription_survives_old_handle_drop() {
        let dispatcher = ChatDispatcher::new();
        let first = dispatcher.subscribe(|_| {}, |_| {}, |_| true);
        let second = dispatcher.subscribe(|_| {}, |_| {}, |_| false);
        drop(first);
        // the replacement subscription is still active
        assert!(!dispatcher.deliver(&message("m1", "alice", 0)));
        drop(second);
        assert!(dispatcher.deliver(&message("m2", "alice", 1)));
    }
}
