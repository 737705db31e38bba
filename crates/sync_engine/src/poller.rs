use std::{
    future::Future,
    ops::ControlFlow,
    sync::{Arc, Mutex, PoisonError, Weak},
    time::Duration,
};

use futures::Stream;
use shared::{
    error::Fault,
    protocol::{ConversationSummary, MessageQuery, MessageRecord},
};
use tokio::{
    sync::{
        broadcast::{
            self,
            error::{RecvError, TryRecvError},
        },
        watch,
    },
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{debug, error, warn};

use crate::{
    fault::{classify, safe_call},
    reconcile::{fetch_conversations, ReconcileOutcome},
    watermark::PollWindow,
    SyncEngine,
};

struct RunningTimer {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Holds at most one running interval timer.
pub struct PollerSlot {
    name: &'static str,
    timer: Mutex<Option<RunningTimer>>,
}

impl PollerSlot {
    pub(crate) fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            timer: Mutex::new(None),
        })
    }

    pub fn is_running(&self) -> bool {
        let timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        timer
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Starts a timer unless one is already running. Returns whether a new
    /// one was spawned.
    pub(crate) fn start_with(
        &self,
        spawn: impl FnOnce(watch::Receiver<bool>) -> JoinHandle<()>,
    ) -> bool {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if timer
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
        {
            return false;
        }
        let (stop, stop_rx) = watch::channel(false);
        *timer = Some(RunningTimer {
            stop,
            handle: spawn(stop_rx),
        });
        debug!(poller = self.name, "poll: timer started");
        true
    }

    /// Signals the timer to exit. A tick already in progress runs to
    /// completion; nothing is aborted mid-call.
    pub fn stop(&self) -> bool {
        let running = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match running {
            Some(running) => {
                let _ = running.stop.send(true);
                debug!(poller = self.name, "poll: timer stopped");
                true
            }
            None => false,
        }
    }
}

/// Ticks every `period`, first tick one period from now, until stopped, the
/// engine is dropped, or `tick` breaks.
fn spawn_interval<F, Fut>(
    engine: Weak<SyncEngine>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<SyncEngine>) -> Fut + Send + 'static,
    Fut: Future<Output = ControlFlow<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => break,
            }
            if *stop.borrow() {
                break;
            }
            let Some(engine) = engine.upgrade() else {
                break;
            };
            if tick(engine).await.is_break() {
                break;
            }
        }
    })
}

/// Receiving end of a message or conversation stream.
pub struct Subscription<T> {
    receiver: broadcast::Receiver<T>,
    poller: Arc<PollerSlot>,
}

pub type MessageSubscription = Subscription<MessageRecord>;
pub type ConversationSubscription = Subscription<Vec<ConversationSummary>>;

impl<T: Clone + Send + 'static> Subscription<T> {
    fn new(receiver: broadcast::Receiver<T>, poller: Arc<PollerSlot>) -> Self {
        Self { receiver, poller }
    }

    /// Next item, or `None` once the session that produced it is cleaned up.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.recv().await {
                Ok(item) => return Some(item),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "poll: subscriber lagged, oldest items dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.try_recv() {
                Ok(item) => return Some(item),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "poll: subscriber lagged, oldest items dropped");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Stops the timer feeding this stream. The engine's polling flag is
    /// left alone; use [`SyncEngine::stop_polling`] for that.
    pub fn deactivate(self) {
        self.poller.stop();
    }

    pub fn into_stream(self) -> impl Stream<Item = T> + Send + 'static {
        BroadcastStream::new(self.receiver).filter_map(|item| item.ok())
    }
}

impl SyncEngine {
    /// One message poll pass: full sync, then the latest page of every
    /// conversation, delivering each unseen message newer than the watermark
    /// exactly once. Returns the number delivered.
    ///
    /// Only a transient memory fault from the full sync is reported; every
    /// other failure is logged and the pass continues.
    pub async fn poll_messages(&self) -> Result<usize, Fault> {
        let Some((client, epoch)) = self.ready_client().await else {
            return Ok(0);
        };

        if let Err(err) = client.sync_all().await {
            let fault = classify(&err);
            if fault.is_transient_memory() {
                return Err(fault);
            }
            warn!(
                kind = ?fault.kind,
                error = %fault.message,
                "poll: sync before message poll failed, reading cached state"
            );
        }

        let conversations = fetch_conversations(client.as_ref()).await;
        let mut window = PollWindow::open(&*self.dedup.lock().await);
        let mut delivered = 0;

        for conversation in &conversations {
            let mut page = match safe_call(
                "list_messages",
                client.list_messages(
                    &conversation.id,
                    MessageQuery::latest(self.config.message_poll_limit),
                ),
                Vec::new(),
            )
            .await
            {
                Ok(page) => page,
                Err(fault) => {
                    warn!(
                        conversation_id = %conversation.id,
                        kind = ?fault.kind,
                        error = %fault.message,
                        "poll: listing messages failed, skipping conversation"
                    );
                    continue;
                }
            };
            page.sort_by_key(|message| message.sent_at_ns);

            for message in page {
                let id = message.stable_id();
                let sent_at_ms = message.sent_at_ms();
                {
                    let mut dedup = self.dedup.lock().await;
                    if !self.is_current(epoch) {
                        debug!("poll: session changed mid-poll, discarding pass");
                        return Ok(delivered);
                    }
                    if !window.admit(&mut dedup, &id, sent_at_ms) {
                        continue;
                    }
                }

                let sender_display_identity = self
                    .identities
                    .display_identity(client.as_ref(), &message.sender_inbox_id)
                    .await;
                if !self.is_current(epoch) {
                    return Ok(delivered);
                }
                self.publish_message(MessageRecord {
                    id,
                    conversation_id: conversation.id.clone(),
                    content: message.content,
                    sender_display_identity,
                    sent_at_ms,
                });
                delivered += 1;
            }
        }

        let mut dedup = self.dedup.lock().await;
        if self.is_current(epoch) {
            window.close(&mut dedup);
        }
        if delivered > 0 {
            debug!(delivered, watermark_ms = dedup.watermark_ms(), "poll: delivered new messages");
        }
        Ok(delivered)
    }

    /// Rebuilds the conversation list and publishes it when it changed.
    /// `None` when there is no ready client or the session changed meanwhile.
    pub async fn reconcile_now(&self) -> Option<ReconcileOutcome> {
        let (client, epoch) = self.ready_client().await?;
        let conversations = self
            .reconciler
            .build(client.as_ref(), &self.identities)
            .await;
        let Some(outcome) = self
            .reconciler
            .store_if(conversations, || self.is_current(epoch))
            .await
        else {
            debug!("sync: session changed during reconcile, discarding result");
            return None;
        };
        if outcome.changed {
            debug!(
                conversations = outcome.conversations.len(),
                "sync: conversation list changed"
            );
            self.publish_conversations(outcome.conversations.clone());
        }
        Some(outcome)
    }

    async fn message_tick(self: Arc<Self>) -> ControlFlow<()> {
        match self.poll_messages().await {
            Ok(_) => ControlFlow::Continue(()),
            Err(fault) => {
                error!(
                    error = %fault.message,
                    "poll: transient memory fault during message poll, stopping pollers"
                );
                self.stop_polling();
                self.record_session_error(fault).await;
                ControlFlow::Break(())
            }
        }
    }

    async fn conversation_tick(self: Arc<Self>) -> ControlFlow<()> {
        self.reconcile_now().await;
        ControlFlow::Continue(())
    }

    fn ensure_message_timer(self: &Arc<Self>) {
        let engine = Arc::downgrade(self);
        let period = self.config.message_poll_interval;
        self.message_poller.start_with(|stop| {
            spawn_interval(engine, period, stop, |engine| engine.message_tick())
        });
    }

    fn ensure_conversation_timer(self: &Arc<Self>) {
        let engine = Arc::downgrade(self);
        let period = self.config.conversation_poll_interval;
        self.conversation_poller.start_with(|stop| {
            spawn_interval(engine, period, stop, |engine| engine.conversation_tick())
        });
    }

    /// Subscribes to new messages and makes sure the message timer runs.
    pub fn stream_messages(self: &Arc<Self>) -> MessageSubscription {
        let receiver = self.subscribe_messages();
        self.set_polling(true);
        self.ensure_message_timer();
        Subscription::new(receiver, Arc::clone(&self.message_poller))
    }

    /// Subscribes to conversation list changes and makes sure the
    /// conversation timer runs.
    pub fn stream_conversations(self: &Arc<Self>) -> ConversationSubscription {
        let receiver = self.subscribe_conversations();
        self.set_polling(true);
        self.ensure_conversation_timer();
        Subscription::new(receiver, Arc::clone(&self.conversation_poller))
    }

    pub fn start_polling(self: &Arc<Self>) {
        self.set_polling(true);
        self.ensure_message_timer();
        self.ensure_conversation_timer();
    }

    pub fn stop_polling(&self) {
        self.message_poller.stop();
        self.conversation_poller.stop();
        self.set_polling(false);
    }

    pub fn message_poller_running(&self) -> bool {
        self.message_poller.is_running()
    }

    pub fn conversation_poller_running(&self) -> bool {
        self.conversation_poller.is_running()
    }
}

#[cfg(test)]
#[path = "tests/poller_tests.rs"]
mod tests;
