//! Cancellable event streams
//!
//! A [`CancellableStream`] wraps one live producer (a sampling cursor or an
//! analyzer) behind a bounded channel. The consumer either registers one
//! handler per event kind and spawns a driver task, or pipes the stream into
//! a [`SchemaAnalyzer`]. Closing a stream aborts the producer tasks attached
//! to it and closes every upstream stream chained to it, so tearing down the
//! outermost stream of a pipe releases the whole chain.
//!
//! End of stream is signalled by the producer dropping its [`StreamSender`].
//! An error event terminates the stream; no end event follows it.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::debug;

use crate::inference::{AnalysisError, Schema, SchemaAnalyzer};
use crate::sampling::{SamplingError, SamplingResult};
use crate::store::{Record, StoreError};

/// Error carried by a stream's error event
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StreamError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

/// Event emitted by a stream producer
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent<T> {
    Data(T),
    Progress,
    Error(StreamError),
}

/// Producer half of a [`CancellableStream`]
#[derive(Debug)]
pub struct StreamSender<T> {
    tx: mpsc::Sender<StreamEvent<T>>,
}

impl<T> Clone for StreamSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> StreamSender<T> {
    /// Emit a data event, waiting for channel capacity
    ///
    /// Returns `false` once the consumer is gone; producers should stop.
    pub async fn data(&self, value: T) -> bool {
        self.tx.send(StreamEvent::Data(value)).await.is_ok()
    }

    pub async fn progress(&self) -> bool {
        self.tx.send(StreamEvent::Progress).await.is_ok()
    }

    pub async fn error(&self, error: impl Into<StreamError>) -> bool {
        self.tx.send(StreamEvent::Error(error.into())).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Default)]
struct Resources {
    tasks: Vec<AbortHandle>,
    upstream: Vec<StreamCloser>,
}

struct CloseInner {
    closed: watch::Sender<bool>,
    resources: Mutex<Resources>,
    /// held while a handler runs
    dispatch: Mutex<()>,
    /// thread running the current handler, if any
    dispatcher: Mutex<Option<ThreadId>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Cloneable handle that closes a stream and everything it owns
#[derive(Clone)]
pub struct StreamCloser {
    inner: Arc<CloseInner>,
}

impl std::fmt::Debug for StreamCloser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCloser")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl StreamCloser {
    fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(CloseInner {
                closed,
                resources: Mutex::new(Resources::default()),
                dispatch: Mutex::new(()),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    /// Close the stream
    ///
    /// Idempotent. Aborts attached tasks and closes chained upstream streams.
    /// A handler running on another thread is waited for; no handler runs
    /// after this returns. Calling it from inside one of this stream's
    /// handlers does not wait.
    pub fn close(&self) {
        if self.inner.closed.send_replace(true) {
            return;
        }
        let in_handler = *lock(&self.inner.dispatcher) == Some(thread::current().id());
        if !in_handler {
            drop(lock(&self.inner.dispatch));
        }
        let resources = std::mem::take(&mut *lock(&self.inner.resources));
        debug!(
            tasks = resources.tasks.len(),
            upstream = resources.upstream.len(),
            "Closing stream"
        );
        for task in resources.tasks {
            task.abort();
        }
        for upstream in resources.upstream {
            upstream.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Tie a producer task's lifetime to this stream
    pub fn attach_task(&self, task: AbortHandle) {
        let mut resources = lock(&self.inner.resources);
        if self.is_closed() {
            task.abort();
        } else {
            resources.tasks.push(task);
        }
    }

    /// Close `upstream` whenever this stream is closed
    pub fn chain(&self, upstream: StreamCloser) {
        let mut resources = lock(&self.inner.resources);
        if self.is_closed() {
            drop(resources);
            upstream.close();
        } else {
            resources.upstream.push(upstream);
        }
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.closed.subscribe()
    }

    /// Run `handler` unless the stream is closed; `false` if it was skipped
    fn dispatch(&self, handler: impl FnOnce()) -> bool {
        let _dispatch = lock(&self.inner.dispatch);
        if self.is_closed() {
            return false;
        }
        *lock(&self.inner.dispatcher) = Some(thread::current().id());
        handler();
        *lock(&self.inner.dispatcher) = None;
        true
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    loop {
        let is_closed = *closed.borrow_and_update();
        if is_closed || closed.changed().await.is_err() {
            return;
        }
    }
}

type DataHandler<T> = Box<dyn FnMut(T) + Send>;
type ProgressHandler = Box<dyn FnMut() + Send>;
type ErrorHandler = Box<dyn FnOnce(StreamError) + Send>;
type EndHandler = Box<dyn FnOnce() + Send>;

/// Consumer half of a live event stream
pub struct CancellableStream<T> {
    events: mpsc::Receiver<StreamEvent<T>>,
    closer: StreamCloser,
    on_data: Option<DataHandler<T>>,
    on_progress: Option<ProgressHandler>,
    on_error: Option<ErrorHandler>,
    on_end: Option<EndHandler>,
}

impl<T> std::fmt::Debug for CancellableStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellableStream")
            .field("closed", &self.closer.is_closed())
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> CancellableStream<T> {
    /// Create a connected producer/consumer pair
    pub fn channel(capacity: usize) -> (StreamSender<T>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (StreamSender { tx }, Self::from_receiver(rx))
    }

    /// A stream that replays `events` and then ends
    pub fn from_events(events: Vec<StreamEvent<T>>) -> Self {
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            // capacity covers every event
            let _ = tx.try_send(event);
        }
        Self::from_receiver(rx)
    }

    fn from_receiver(events: mpsc::Receiver<StreamEvent<T>>) -> Self {
        Self {
            events,
            closer: StreamCloser::new(),
            on_data: None,
            on_progress: None,
            on_error: None,
            on_end: None,
        }
    }

    pub fn closer(&self) -> StreamCloser {
        self.closer.clone()
    }

    pub fn close(&self) {
        self.closer.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }

    /// Register the data handler
    pub fn on_data(&mut self, handler: impl FnMut(T) + Send + 'static) -> SamplingResult<&mut Self> {
        if self.on_data.is_some() {
            return Err(SamplingError::HandlerAlreadyRegistered("data"));
        }
        self.on_data = Some(Box::new(handler));
        Ok(self)
    }

    /// Register the progress handler
    pub fn on_progress(
        &mut self,
        handler: impl FnMut() + Send + 'static,
    ) -> SamplingResult<&mut Self> {
        if self.on_progress.is_some() {
            return Err(SamplingError::HandlerAlreadyRegistered("progress"));
        }
        self.on_progress = Some(Box::new(handler));
        Ok(self)
    }

    /// Register the error handler
    pub fn on_error(
        &mut self,
        handler: impl FnOnce(StreamError) + Send + 'static,
    ) -> SamplingResult<&mut Self> {
        if self.on_error.is_some() {
            return Err(SamplingError::HandlerAlreadyRegistered("error"));
        }
        self.on_error = Some(Box::new(handler));
        Ok(self)
    }

    /// Register the end handler
    pub fn on_end(&mut self, handler: impl FnOnce() + Send + 'static) -> SamplingResult<&mut Self> {
        if self.on_end.is_some() {
            return Err(SamplingError::HandlerAlreadyRegistered("end"));
        }
        self.on_end = Some(Box::new(handler));
        Ok(self)
    }

    /// Pull the next event; `None` at end of stream or once closed
    pub async fn next(&mut self) -> Option<StreamEvent<T>> {
        let mut closed = self.closer.subscribe();
        let event = tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => None,
            event = self.events.recv() => event,
        };
        if self.closer.is_closed() { None } else { event }
    }

    /// Attach a producer task to this stream
    pub fn attach_task(&self, task: AbortHandle) {
        self.closer.attach_task(task);
    }

    /// Close `upstream` together with this stream
    pub fn chain(&self, upstream: StreamCloser) {
        self.closer.chain(upstream);
    }

    /// Drive the registered handlers on a background task
    ///
    /// Requires a tokio runtime. The returned closer tears the stream down.
    pub fn spawn(self) -> StreamCloser {
        let closer = self.closer.clone();
        let task = tokio::spawn(self.drive());
        closer.attach_task(task.abort_handle());
        closer
    }

    async fn drive(mut self) {
        let mut closed = self.closer.subscribe();
        loop {
            let event = tokio::select! {
                biased;
                _ = wait_closed(&mut closed) => return,
                event = self.events.recv() => event,
            };
            let closer = &self.closer;
            let delivered = match event {
                Some(StreamEvent::Data(value)) => match self.on_data.as_mut() {
                    Some(handler) => closer.dispatch(|| handler(value)),
                    None => !closer.is_closed(),
                },
                Some(StreamEvent::Progress) => match self.on_progress.as_mut() {
                    Some(handler) => closer.dispatch(handler),
                    None => !closer.is_closed(),
                },
                Some(StreamEvent::Error(error)) => {
                    self.dispatch_error(error);
                    self.closer.close();
                    return;
                }
                None => {
                    if let Some(handler) = self.on_end.take() {
                        closer.dispatch(handler);
                    }
                    self.closer.close();
                    return;
                }
            };
            if !delivered {
                return;
            }
        }
    }

    fn dispatch_error(&mut self, error: StreamError) {
        match self.on_error.take() {
            Some(handler) => {
                self.closer.dispatch(|| handler(error));
            }
            None => debug!(error = %error, "Stream error without handler"),
        }
    }
}

impl CancellableStream<Record> {
    /// Feed this stream's records into `analyzer`
    ///
    /// Records are forwarded through a channel of `capacity` slots, so a slow
    /// analyzer holds back the sampler. An upstream error goes to this
    /// stream's error handler and closes the analyzer stream without an end
    /// event. Closing the returned stream closes this one too.
    pub fn pipe(self, analyzer: &dyn SchemaAnalyzer, capacity: usize) -> CancellableStream<Schema> {
        let (input, records) = mpsc::channel(capacity.max(1));
        let downstream = analyzer.analyze(records);
        downstream.chain(self.closer.clone());

        let upstream = self.closer.clone();
        let task = tokio::spawn(self.forward(input, downstream.closer()));
        upstream.attach_task(task.abort_handle());
        downstream
    }

    async fn forward(mut self, input: mpsc::Sender<Record>, downstream: StreamCloser) {
        let mut closed = self.closer.subscribe();
        loop {
            let event = tokio::select! {
                biased;
                _ = wait_closed(&mut closed) => return,
                event = self.events.recv() => event,
            };
            match event {
                Some(StreamEvent::Data(record)) => {
                    let sent = tokio::select! {
                        biased;
                        _ = wait_closed(&mut closed) => return,
                        sent = input.send(record) => sent,
                    };
                    if sent.is_err() {
                        // analyzer stopped reading
                        return;
                    }
                }
                Some(StreamEvent::Progress) => {}
                Some(StreamEvent::Error(error)) => {
                    self.dispatch_error(error);
                    downstream.close();
                    return;
                }
                None => {
                    if let Some(handler) = self.on_end.take() {
                        self.closer.dispatch(handler);
                    }
                    // dropping `input` ends the analyzer's record stream
                    return;
                }
            }
        }
    }
}
