//! Outbound rate governor.
//!
//! Keeps the service under the channel platform's throughput limits by
//! delaying sends, never dropping them. Admission is tracked with sliding
//! windows over the last 60 seconds: a global per-second and per-minute
//! ceiling, plus a per-conversation per-minute ceiling. A separate
//! per-conversation permit cap bounds in-flight sends so one busy
//! conversation cannot starve the rest of the queue.
//!
//! Window state is in-memory only; losing it on restart just means the
//! first post-restart window is slightly more permissive than strictly
//! necessary, which the conservative ceilings absorb.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::config::LimitsConfig;
use crate::error::ChannelError;

const WINDOW_MINUTE: Duration = Duration::from_secs(60);
const WINDOW_SECOND: Duration = Duration::from_secs(1);

/// Sliding admission log for one ceiling.
#[derive(Debug)]
struct SlidingWindow {
    admissions: VecDeque<Instant>,
    limit: usize,
    span: Duration,
}

impl SlidingWindow {
    fn new(limit: u32, span: Duration) -> Self {
        Self {
            admissions: VecDeque::with_capacity(limit as usize),
            limit: limit as usize,
            span,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.admissions.front() {
            if now.duration_since(*front) >= self.span {
                self.admissions.pop_front();
            } else {
                break;
            }
        }
    }

    /// When the next admission becomes possible; `None` means immediately.
    fn next_free_at(&mut self, now: Instant) -> Option<Instant> {
        self.prune(now);
        if self.admissions.len() < self.limit {
            None
        } else {
            self.admissions.front().map(|front| *front + self.span)
        }
    }

    fn record(&mut self, now: Instant) {
        self.admissions.push_back(now);
    }
}

#[derive(Debug)]
struct GlobalWindows {
    per_sec: SlidingWindow,
    per_min: SlidingWindow,
}

struct ChatState {
    window: SlidingWindow,
    permits: Arc<Semaphore>,
    last_used: Instant,
}

/// A granted send slot. Holding it keeps the per-conversation concurrency
/// permit; drop it when the send completes.
pub struct SendPermit {
    _chat_permit: Option<OwnedSemaphorePermit>,
}

/// Outbound throughput limiter. Delays, never drops.
pub struct RateGovernor {
    global: Mutex<GlobalWindows>,
    chats: Mutex<HashMap<i64, ChatState>>,
    per_chat_per_min: u32,
    per_chat_concurrency: u32,
    max_send_attempts: u32,
    backoff_base: Duration,
    backoff_ceiling: Duration,
}

impl RateGovernor {
    pub fn new(config: &LimitsConfig) -> Self {
        Self {
            global: Mutex::new(GlobalWindows {
                per_sec: SlidingWindow::new(config.global_per_sec, WINDOW_SECOND),
                per_min: SlidingWindow::new(config.global_per_min, WINDOW_MINUTE),
            }),
            chats: Mutex::new(HashMap::new()),
            per_chat_per_min: config.per_chat_per_min,
            per_chat_concurrency: config.per_chat_concurrency.max(1),
            max_send_attempts: config.max_send_attempts.max(1),
            backoff_base: config.backoff_base,
            backoff_ceiling: config.backoff_ceiling,
        }
    }

    /// Block until a send is admissible for the global ceilings and, when a
    /// conversation is given, its per-conversation ceiling. Returns a permit
    /// that also holds the conversation's concurrency slot.
    pub async fn acquire(&self, conversation: Option<i64>) -> SendPermit {
        // The concurrency permit is taken first so waiting senders for the
        // same conversation queue here instead of piling onto the windows.
        let chat_permit = match conversation {
            Some(id) => Some(self.chat_semaphore(id).await.acquire_owned().await
                .unwrap_or_else(|_| unreachable!("governor semaphores are never closed"))),
            None => None,
        };

        loop {
            let now = Instant::now();
            let mut wait_until: Option<Instant> = None;

            {
                let mut global = self.global.lock().await;
                let sec = global.per_sec.next_free_at(now);
                let min = global.per_min.next_free_at(now);
                wait_until = max_instant(wait_until, sec);
                wait_until = max_instant(wait_until, min);

                if wait_until.is_none() {
                    if let Some(id) = conversation {
                        let mut chats = self.chats.lock().await;
                        let state = self.chat_state(&mut chats, id, now);
                        if let Some(free_at) = state.window.next_free_at(now) {
                            wait_until = Some(free_at);
                        } else {
                            state.window.record(now);
                            state.last_used = now;
                            global.per_sec.record(now);
                            global.per_min.record(now);
                            return SendPermit {
                                _chat_permit: chat_permit,
                            };
                        }
                    } else {
                        global.per_sec.record(now);
                        global.per_min.record(now);
                        return SendPermit {
                            _chat_permit: chat_permit,
                        };
                    }
                }
            }

            match wait_until {
                Some(at) => tokio::time::sleep_until(at).await,
                // Unreachable: no wait means we returned above.
                None => tokio::task::yield_now().await,
            }
        }
    }

    /// Acquire + run `op`, honoring the channel's "rate limited, retry after"
    /// signal with bounded exponential backoff. Any other error surfaces
    /// immediately; exhausting the attempt limit surfaces a hard failure.
    pub async fn send_with_backoff<T, F, Fut>(
        &self,
        conversation: Option<i64>,
        mut op: F,
    ) -> Result<T, ChannelError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ChannelError>>,
    {
        let mut delay = self.backoff_base;
        let mut last_reason = String::new();

        for attempt in 1..=self.max_send_attempts {
            let permit = self.acquire(conversation).await;
            let result = op().await;
            drop(permit);

            match result {
                Ok(value) => return Ok(value),
                Err(ChannelError::RateLimited { retry_after }) => {
                    let wait = retry_after.unwrap_or(delay).max(delay).min(self.backoff_ceiling);
                    tracing::warn!(
                        ?conversation,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        "channel rate limited, backing off"
                    );
                    last_reason = format!("rate limited on attempt {attempt}");
                    tokio::time::sleep(wait + jitter(wait)).await;
                    delay = (delay * 2).min(self.backoff_ceiling);
                }
                Err(other) => return Err(other),
            }
        }

        Err(ChannelError::RetriesExhausted {
            attempts: self.max_send_attempts,
            reason: last_reason,
        })
    }

    async fn chat_semaphore(&self, conversation: i64) -> Arc<Semaphore> {
        let mut chats = self.chats.lock().await;
        let now = Instant::now();
        let concurrency = self.per_chat_concurrency;
        let per_min = self.per_chat_per_min;
        let state = chats.entry(conversation).or_insert_with(|| ChatState {
            window: SlidingWindow::new(per_min, WINDOW_MINUTE),
            permits: Arc::new(Semaphore::new(concurrency as usize)),
            last_used: now,
        });
        Arc::clone(&state.permits)
    }

    fn chat_state<'a>(
        &self,
        chats: &'a mut HashMap<i64, ChatState>,
        conversation: i64,
        now: Instant,
    ) -> &'a mut ChatState {
        let concurrency = self.per_chat_concurrency;
        let per_min = self.per_chat_per_min;
        chats.entry(conversation).or_insert_with(|| ChatState {
            window: SlidingWindow::new(per_min, WINDOW_MINUTE),
            permits: Arc::new(Semaphore::new(concurrency as usize)),
            last_used: now,
        })
    }

    /// Drop per-conversation state idle for longer than two minute-windows.
    /// Called from the runtime's background sweep.
    pub async fn evict_idle_conversations(&self) -> usize {
        let mut chats = self.chats.lock().await;
        let now = Instant::now();
        let before = chats.len();
        chats.retain(|_, state| now.duration_since(state.last_used) < WINDOW_MINUTE * 2);
        before - chats.len()
    }
}

fn max_instant(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (Some(x), None) => Some(x),
        (None, Some(y)) => Some(y),
        (None, None) => None,
    }
}

/// Up to 10% extra sleep so synchronized retries fan out.
fn jitter(base: Duration) -> Duration {
    use rand::Rng;
    let cap = (base.as_millis() as u64 / 10).max(1);
    Duration::from_millis(rand::thread_rng().gen_range(0..cap))
}
