//! The seam between the core and the low-level wire driver.
//!
//! Frame encoding, authentication, and SSL handshaking are explicitly out of
//! scope here: this module assumes a driver exposing `connect`, `execute`,
//! `close`, an error/end signal, and (for notification mode) an inbound
//! notification signal carrying `(channel, payload)`. The only
//! implementation shipped wraps [`tokio_postgres`]; the trait exists so the
//! Supervisor/executors aren't hard-wired to its types.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_postgres::types::ToSql;
use tokio_postgres::AsyncMessage;

use crate::error::Error;

/// A signal pushed by the spawned driver task for the Supervisor (and, for
/// notifications, the `NotificationManager`) to react to.
#[derive(Debug)]
pub enum DriverSignal {
    /// A `NOTIFY` payload arrived on some channel.
    Notification { channel: String, payload: String },
    /// The driver task ended with an error; the connection is dead.
    Error(Arc<tokio_postgres::Error>),
    /// The driver task ended cleanly (the peer closed the connection).
    End,
}

/// A single live connection handed out by a [`Driver`].
///
/// Ownership is exclusive to whichever Supervisor created it: executors call
/// `execute`/`batch_execute`, they never `close` it themselves.
pub trait RawConnection: Send + Sync + 'static {
    /// The row type `execute` hands back. Kept abstract rather than fixed to
    /// `tokio_postgres::Row` so the core never needs a live server to
    /// exercise the Supervisor/executor state machines (see
    /// [`testing::FakeConnection`]).
    type Row: Send + 'static;

    /// Runs `sql` with `params`, returning the resulting rows. Used for
    /// both the probe statement and application queries.
    fn execute(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> impl Future<Output = Result<Vec<Self::Row>, Error>> + Send + '_;

    /// Runs a statement that returns no rows (`BEGIN`, `COMMIT`, `ROLLBACK`,
    /// `LISTEN "..."`, `UNLISTEN "..."`).
    fn batch_execute(&self, sql: &str) -> impl Future<Output = Result<(), Error>> + Send + '_;

    /// Releases driver-side resources. Only the Supervisor that created this
    /// connection ever calls it. The default no-op suits drivers (like
    /// `tokio_postgres`) that close on drop.
    fn close(&self) -> impl Future<Output = ()> + Send + '_ {
        async {}
    }
}

/// Opens connections and hands back both the connection and the channel the
/// Supervisor should watch for its error/end/notification signal.
pub trait Driver: Send + Sync + 'static {
    type Connection: RawConnection;

    fn connect(
        &self,
    ) -> impl Future<Output = Result<(Self::Connection, mpsc::UnboundedReceiver<DriverSignal>), Error>>
           + Send
           + '_;
}

/// Lets a Supervisor own a `Driver` by `Arc` so test code can keep a handle
/// to it (e.g. [`testing::FakeDriver::inject`]) alongside the Supervisor.
impl<T: Driver> Driver for Arc<T> {
    type Connection = T::Connection;

    async fn connect(&self) -> Result<(T::Connection, mpsc::UnboundedReceiver<DriverSignal>), Error> {
        (**self).connect().await
    }
}

/// The real [`Driver`], backed by `tokio_postgres` over a plaintext socket.
///
/// TLS is deliberately not modeled here beyond accepting any
/// `tokio_postgres::tls::MakeTlsConnect`; callers that need TLS construct
/// `TokioPostgresDriver` with a rustls/native-tls connector instead of
/// `NoTls`.
pub struct TokioPostgresDriver<T> {
    config: tokio_postgres::Config,
    tls: T,
}

impl<T> TokioPostgresDriver<T>
where
    T: tokio_postgres::tls::MakeTlsConnect<tokio_postgres::Socket> + Clone + Send + Sync + 'static,
    T::Stream: Send,
    T::TlsConnect: Send,
    <T::TlsConnect as tokio_postgres::tls::TlsConnect<tokio_postgres::Socket>>::Future: Send,
{
    pub fn new(config: tokio_postgres::Config, tls: T) -> Self {
        Self { config, tls }
    }
}

impl<T> Driver for TokioPostgresDriver<T>
where
    T: tokio_postgres::tls::MakeTlsConnect<tokio_postgres::Socket> + Clone + Send + Sync + 'static,
    T::Stream: Send,
    T::TlsConnect: Send,
    <T::TlsConnect as tokio_postgres::tls::TlsConnect<tokio_postgres::Socket>>::Future: Send,
{
    type Connection = PgConnection;

    async fn connect(&self) -> Result<(PgConnection, mpsc::UnboundedReceiver<DriverSignal>), Error> {
        let (client, mut connection) = self.config.connect(self.tls.clone()).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let message =
                    std::future::poll_fn(|cx| connection.poll_message(cx)).await;

                match message {
                    Some(Ok(AsyncMessage::Notification(n))) => {
                        let _ = tx.send(DriverSignal::Notification {
                            channel: n.channel().to_owned(),
                            payload: n.payload().to_owned(),
                        });
                    }
                    Some(Ok(_)) => {
                        // AsyncMessage is `#[non_exhaustive]`; notices and
                        // any future variants are not acted on here.
                    }
                    Some(Err(err)) => {
                        let _ = tx.send(DriverSignal::Error(Arc::new(err)));
                        break;
                    }
                    None => {
                        let _ = tx.send(DriverSignal::End);
                        break;
                    }
                }
            }
        });

        Ok((PgConnection { client }, rx))
    }
}

/// [`RawConnection`] wrapping a live `tokio_postgres::Client`.
pub struct PgConnection {
    client: tokio_postgres::Client,
}

impl PgConnection {
    /// Escape hatch for code that needs the underlying client directly
    /// (e.g. `LISTEN`/`UNLISTEN`, which have no parameters to bind).
    pub fn client(&self) -> &tokio_postgres::Client {
        &self.client
    }
}

impl RawConnection for PgConnection {
    type Row = tokio_postgres::Row;

    async fn execute(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<tokio_postgres::Row>, Error> {
        Ok(self.client.query(sql, params).await?)
    }

    async fn batch_execute(&self, sql: &str) -> Result<(), Error> {
        Ok(self.client.batch_execute(sql).await?)
    }
}

/// An in-memory [`Driver`]/[`RawConnection`] pair for exercising the
/// Supervisor and executor state machines without a live server. Enabled by
/// the `testing` feature, for unit-testing pool/connection logic in
/// isolation.
#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// One queued response for [`FakeConnection::execute`].
    #[derive(Clone)]
    enum Outcome {
        Rows(usize),
        /// A fatal, non-retriable error ([`Error::ProbeFailed`]).
        Error,
        /// A transient error ([`Error::Io`] with a retriable `ErrorKind`),
        /// for exercising executor/reconnect retry paths.
        TransientError,
        Hang,
    }

    /// A [`RawConnection`] whose `execute`/`batch_execute` behavior is
    /// scripted ahead of time: a queue of one-shot [`Outcome`]s, falling
    /// back to a fixed default once the queue is drained.
    pub struct FakeConnection {
        queue: Mutex<VecDeque<Outcome>>,
        default: Outcome,
    }

    /// A row shape with nothing in it: the core never decodes column data,
    /// only counts rows, so there is nothing to fake beyond presence.
    pub struct FakeRow;

    impl FakeConnection {
        pub fn healthy() -> Self {
            Self::with_default(Outcome::Rows(1))
        }

        pub fn empty_rows() -> Self {
            Self::with_default(Outcome::Rows(0))
        }

        pub fn errors() -> Self {
            Self::with_default(Outcome::Error)
        }

        pub fn hangs() -> Self {
            Self::with_default(Outcome::Hang)
        }

        fn with_default(default: Outcome) -> Self {
            Self {
                queue: Mutex::new(VecDeque::new()),
                default,
            }
        }

        /// Queues one successful response ahead of the default.
        pub fn push_rows(&self, count: usize) {
            self.queue.lock().unwrap().push_back(Outcome::Rows(count));
        }

        /// Queues one fatal, non-retriable error response ahead of the default.
        pub fn push_error(&self) {
            self.queue.lock().unwrap().push_back(Outcome::Error);
        }

        /// Queues one transient, retriable error response ahead of the default.
        pub fn push_transient_error(&self) {
            self.queue.lock().unwrap().push_back(Outcome::TransientError);
        }

        fn next(&self) -> Outcome {
            self.queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.default.clone())
        }
    }

    impl RawConnection for FakeConnection {
        type Row = FakeRow;

        async fn execute(
            &self,
            _sql: &str,
            _params: &[&(dyn ToSql + Sync)],
        ) -> Result<Vec<FakeRow>, Error> {
            match self.next() {
                Outcome::Rows(n) => Ok((0..n).map(|_| FakeRow).collect()),
                Outcome::Error => Err(fake_driver_error()),
                Outcome::TransientError => Err(fake_transient_error()),
                Outcome::Hang => std::future::pending().await,
            }
        }

        async fn batch_execute(&self, _sql: &str) -> Result<(), Error> {
            match self.next() {
                Outcome::Rows(_) => Ok(()),
                Outcome::Error => Err(fake_driver_error()),
                Outcome::TransientError => Err(fake_transient_error()),
                Outcome::Hang => std::future::pending().await,
            }
        }
    }

    fn fake_driver_error() -> Error {
        Error::ProbeFailed("fake connection scripted to fail".into())
    }

    fn fake_transient_error() -> Error {
        Error::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset).into())
    }

    /// A [`Driver`] that hands out [`FakeConnection`]s, with a scriptable
    /// connect outcome queue mirroring `FakeConnection`'s execute queue.
    /// Keeps the sending half of the most recent connect's signal channel so
    /// tests can [`FakeDriver::inject`] a disconnect/notification signal as
    /// if the background driver task had observed one.
    pub struct FakeDriver {
        connect_queue: Mutex<VecDeque<bool>>,
        make_connection: Box<dyn Fn() -> FakeConnection + Send + Sync>,
        last_signal_tx: Mutex<Option<mpsc::UnboundedSender<DriverSignal>>>,
    }

    impl FakeDriver {
        /// Every connect attempt succeeds, handing out connections built by
        /// `make_connection` (e.g. `FakeConnection::healthy`).
        pub fn always_succeeds(make_connection: impl Fn() -> FakeConnection + Send + Sync + 'static) -> Self {
            Self {
                connect_queue: Mutex::new(VecDeque::new()),
                make_connection: Box::new(make_connection),
                last_signal_tx: Mutex::new(None),
            }
        }

        /// Queues one connect outcome (`true` = succeed, `false` = fail)
        /// ahead of the default (succeed).
        pub fn push_connect_failure(&self) {
            self.connect_queue.lock().unwrap().push_back(false);
        }

        /// Pushes `signal` onto the channel handed back by the most recent
        /// successful `connect()`. Panics if nothing has connected yet.
        pub fn inject(&self, signal: DriverSignal) {
            let guard = self.last_signal_tx.lock().unwrap();
            let tx = guard.as_ref().expect("inject() called before any connect()");
            let _ = tx.send(signal);
        }
    }

    impl Driver for FakeDriver {
        type Connection = FakeConnection;

        async fn connect(
            &self,
        ) -> Result<(FakeConnection, mpsc::UnboundedReceiver<DriverSignal>), Error> {
            let should_succeed = self.connect_queue.lock().unwrap().pop_front().unwrap_or(true);
            if !should_succeed {
                return Err(Error::Io(
                    std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into(),
                ));
            }

            let (tx, rx) = mpsc::unbounded_channel();
            *self.last_signal_tx.lock().unwrap() = Some(tx);
            Ok(((self.make_connection)(), rx))
        }
    }
}
