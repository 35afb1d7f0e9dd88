//! Bounded request queues
//!
//! Each scarce resource (the LLM, the image engine) gets a [`Queue`]: a
//! bounded channel drained by exactly one worker task, so requests for a
//! resource are served strictly one at a time and in order. Submitting
//! never blocks; a full queue hands the request back to the caller so the
//! front end can tell the user to retry.
//!
//! Shutdown pushes a sentinel behind the pending requests and waits for the
//! worker to reach it, so nothing already accepted is dropped.

use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::memory::lock;

/// Processes the requests of one queue, one at a time
#[async_trait]
pub trait RequestHandler<R: Send + 'static>: Send + Sync + 'static {
    async fn handle(&self, request: R);
}

/// A request refused because its queue had no room
pub struct QueueFull<R> {
    queue: String,
    request: R,
}

impl<R> QueueFull<R> {
    /// Name of the queue that refused the request
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Gives the refused request back
    pub fn into_inner(self) -> R {
        self.request
    }
}

impl<R> fmt::Debug for QueueFull<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueFull")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl<R> fmt::Display for QueueFull<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Queue {} is full", self.queue)
    }
}

impl<R> std::error::Error for QueueFull<R> {}

/// Bounded FIFO with a single consuming worker
pub struct Queue<R> {
    name: String,
    capacity: usize,
    // `None` is the stop sentinel.
    tx: mpsc::Sender<Option<R>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<R: Send + 'static> Queue<R> {
    /// Start the worker for a queue holding up to `capacity` pending requests.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0 (configuration validation rejects it).
    pub fn spawn<H>(name: impl Into<String>, capacity: usize, handler: H) -> Self
    where
        H: RequestHandler<R>,
    {
        let name = name.into();
        let (tx, mut rx) = mpsc::channel::<Option<R>>(capacity);
        let worker_name = name.clone();
        let worker = tokio::spawn(async move {
            tracing::debug!(queue = %worker_name, "worker started");
            let mut handled: u64 = 0;
            while let Some(Some(request)) = rx.recv().await {
                handler.handle(request).await;
                handled += 1;
            }
            tracing::debug!(queue = %worker_name, handled, "worker stopped");
        });
        Self {
            name,
            capacity,
            tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue without waiting.
    ///
    /// # Errors
    ///
    /// Returns the request inside [`QueueFull`] when the queue is full or
    /// already shut down.
    pub fn try_submit(&self, request: R) -> Result<(), QueueFull<R>> {
        match self.tx.try_send(Some(request)) {
            Ok(()) => Ok(()),
            Err(e) => {
                if matches!(e, TrySendError::Closed(_)) {
                    tracing::warn!(queue = %self.name, "submit after shutdown");
                } else {
                    tracing::info!(queue = %self.name, "queue full, rejecting request");
                }
                match e.into_inner() {
                    Some(request) => Err(QueueFull {
                        queue: self.name.clone(),
                        request,
                    }),
                    None => Ok(()),
                }
            }
        }
    }

    /// Drain pending requests and stop the worker.
    ///
    /// Later calls return immediately.
    pub async fn shutdown(&self) {
        let worker = lock(&self.worker).take();
        let Some(worker) = worker else {
            return;
        };
        // Waits for room behind the pending requests.
        if self.tx.send(None).await.is_err() {
            tracing::debug!(queue = %self.name, "worker already gone");
        }
        if let Err(e) = worker.await {
            tracing::error!(queue = %self.name, error = %e, "worker panicked");
        }
    }
}

/// Default number of pending chat requests
pub const CHAT_QUEUE_CAPACITY: usize = 5;
/// Default number of pending image requests
pub const IMAGE_QUEUE_CAPACITY: usize = 3;

/// The chat and image queues of one bot
pub struct Dispatcher<C, I> {
    chat: Queue<C>,
    image: Queue<I>,
}

impl<C: Send + 'static, I: Send + 'static> Dispatcher<C, I> {
    pub fn spawn<HC, HI>(
        chat_capacity: usize,
        image_capacity: usize,
        chat_handler: HC,
        image_handler: HI,
    ) -> Self
    where
        HC: RequestHandler<C>,
        HI: RequestHandler<I>,
    {
        Self {
            chat: Queue::spawn("chat", chat_capacity, chat_handler),
            image: Queue::spawn("image", image_capacity, image_handler),
        }
    }

    pub fn submit_chat(&self, request: C) -> Result<(), QueueFull<C>> {
        self.chat.try_submit(request)
    }

    pub fn submit_image(&self, request: I) -> Result<(), QueueFull<I>> {
        self.image.try_submit(request)
    }

    /// Stop both workers after draining, waiting for both.
    pub async fn shutdown(&self) {
        tokio::join!(self.chat.shutdown(), self.image.shutdown());
    }
}
