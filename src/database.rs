//! The top-level database handle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::channel::MessageChannel;
use crate::config::DatabaseOptions;
use crate::connection::Connection;
use crate::error::{BridgeError, BridgeResult};
use crate::files::VirtualFileStore;
use crate::protocol::Payload;
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq)]
enum DatabaseState {
    Unopened,
    Open(DatabaseOptions),
    Terminated,
}

/// Handle to an engine instance running in an isolated host context.
///
/// Owns the message channel, the open-time configuration, and the virtual
/// file namespace shared by all connections. Created unopened; [`open`]
/// configures the engine exactly once, after which [`connect`] mints
/// sessions that snapshot the configuration active at connect time.
///
/// [`open`]: Self::open
/// [`connect`]: Self::connect
pub struct Database {
    channel: Arc<MessageChannel>,
    state: Mutex<DatabaseState>,
    files: VirtualFileStore,
    /// Count of queries currently in flight across all connections.
    inflight: Arc<AtomicUsize>,
}

impl Database {
    /// Attach to an engine host reachable through the given transport.
    pub fn new(transport: Transport) -> Self {
        let channel = Arc::new(MessageChannel::new(transport));
        let files = VirtualFileStore::new(Arc::clone(&channel));
        Self {
            channel,
            state: Mutex::new(DatabaseState::Unopened),
            files,
            inflight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Configure and open the engine instance.
    ///
    /// Options are validated locally before the host round-trip; a
    /// recognized-but-invalid combination fails here with a configuration
    /// error rather than at query time. Opening twice is a state error;
    /// terminate and create a new handle to reconfigure.
    pub async fn open(&self, options: DatabaseOptions) -> BridgeResult<()> {
        options.validate()?;
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            match &*state {
                DatabaseState::Unopened => {}
                DatabaseState::Open(_) => {
                    return Err(BridgeError::state("database is already open"));
                }
                DatabaseState::Terminated => {
                    return Err(BridgeError::state("database has been terminated"));
                }
            }
            // Claimed before the await so a concurrent open fails fast.
            *state = DatabaseState::Open(options.clone());
        }

        let result = self
            .channel
            .request(Payload::OpenRequest {
                options: options.clone(),
            })
            .await;
        match result {
            Ok(Payload::OpenResponse) => {
                debug!("database open at {:?}", options.path);
                Ok(())
            }
            Ok(other) => {
                self.reset_to_unopened();
                Err(BridgeError::protocol(format!(
                    "expected open-response, got {}",
                    other.kind()
                )))
            }
            Err(err) => {
                self.reset_to_unopened();
                Err(err)
            }
        }
    }

    fn reset_to_unopened(&self) {
        let mut state = self.state.lock().expect("state lock poisoned");
        if matches!(&*state, DatabaseState::Open(_)) {
            *state = DatabaseState::Unopened;
        }
    }

    /// Options the database was opened with, if open.
    pub fn options(&self) -> Option<DatabaseOptions> {
        match &*self.state.lock().expect("state lock poisoned") {
            DatabaseState::Open(options) => Some(options.clone()),
            _ => None,
        }
    }

    /// Whether [`open`](Self::open) succeeded and the handle is usable.
    pub fn is_open(&self) -> bool {
        matches!(
            &*self.state.lock().expect("state lock poisoned"),
            DatabaseState::Open(_)
        )
    }

    /// Open a new logical session.
    ///
    /// The connection snapshots the query configuration active now; it is
    /// unaffected by anything that happens to this handle later short of
    /// termination.
    pub async fn connect(&self) -> BridgeResult<Connection> {
        let config = self
            .options()
            .ok_or_else(|| BridgeError::state("database is not open"))?
            .query;

        match self.channel.request(Payload::ConnectRequest).await? {
            Payload::ConnectResponse { session } => {
                debug!("session {} connected", session);
                Ok(Connection::new(
                    Arc::clone(&self.channel),
                    session,
                    config,
                    Arc::clone(&self.inflight),
                ))
            }
            other => Err(BridgeError::protocol(format!(
                "expected connect-response, got {}",
                other.kind()
            ))),
        }
    }

    /// Virtual file namespace shared by all connections.
    pub fn files(&self) -> &VirtualFileStore {
        &self.files
    }

    /// Register a named byte buffer with the engine host.
    pub async fn register_file_buffer(
        &self,
        name: impl Into<String>,
        buffer: Vec<u8>,
    ) -> BridgeResult<()> {
        self.ensure_open()?;
        self.files.register_buffer(name, buffer).await
    }

    /// Make pending virtual file writes visible to the engine.
    pub async fn flush_files(&self) -> BridgeResult<()> {
        self.ensure_open()?;
        self.files.flush().await
    }

    /// Drop a single named buffer.
    ///
    /// Rejected while any query is in flight, like [`drop_files`]
    /// (a query could be reading the buffer mid-drop).
    ///
    /// [`drop_files`]: Self::drop_files
    pub async fn drop_file(&self, name: &str) -> BridgeResult<()> {
        self.ensure_open()?;
        self.ensure_no_inflight()?;
        self.files.drop_file(name).await
    }

    /// Drop every registered buffer, invalidating all names.
    ///
    /// Rejected with a resource error while any connection has a query in
    /// flight; close or cancel first. This is the deterministic alternative
    /// the invariant demands: an in-flight read of an invalidated buffer
    /// is never silently corrupted.
    pub async fn drop_files(&self) -> BridgeResult<()> {
        self.ensure_open()?;
        self.ensure_no_inflight()?;
        self.files.drop_all().await
    }

    /// Tear the handle down: every pending operation resolves with a
    /// cancellation error, every connection is invalidated, and the channel
    /// refuses further work.
    pub fn terminate(&self) {
        let mut state = self.state.lock().expect("state lock poisoned");
        if *state == DatabaseState::Terminated {
            return;
        }
        *state = DatabaseState::Terminated;
        drop(state);

        self.channel.shutdown();
        self.files.clear_local();
        debug!("database terminated");
    }

    fn ensure_open(&self) -> BridgeResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BridgeError::state("database is not open"))
        }
    }

    fn ensure_no_inflight(&self) -> BridgeResult<()> {
        let inflight = self.inflight.load(Ordering::SeqCst);
        if inflight > 0 {
            return Err(BridgeError::Resource(format!(
                "cannot drop virtual files: {} query(ies) in flight",
                inflight
            )));
        }
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.terminate();
    }
}
