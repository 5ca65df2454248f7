//! Session registry: one persistent PTY per project.
//!
//! The registry is the only place sessions are created or destroyed.
//! Creation holds a per-key lock across check, spawn and insert, so
//! concurrent connections for the same project never spawn two processes.
//! The spawn itself runs on the blocking pool without the registry lock, so
//! other sessions keep streaming meanwhile.

use super::interceptor::UrlInterceptor;
use super::launch::ShellSettings;
use super::output_buffer::OutputBuffer;
use super::pty::{PtyEvent, PtyHandle};
use crate::transport::TransportHandle;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use termrelay_core::{normalize_project_path, session_key, RelayError, RelayResult, ServerMessage};
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock};
use tracing::{debug, info, warn};

/// Tunables for the registry.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub max_sessions: usize,
    pub buffer_max_entries: usize,
    pub buffer_trim_to: usize,
    /// How long a graceful kill waits before forcing.
    pub kill_grace: Duration,
    pub shell: ShellSettings,
}

/// A persistent shell bound to one project.
pub struct Session {
    pub key: String,
    pub project_path: PathBuf,
    /// Distinguishes this session from a later one under the same key.
    generation: u64,
    /// Exclusively owned; only the registry kills it.
    pub pty: PtyHandle,
    pub output: OutputBuffer,
    pub created_at: SystemTime,
    /// Monotonic clock for idle checks.
    pub last_active: Instant,
    /// Wall clock twin of `last_active`, for reporting.
    pub last_active_at: SystemTime,
    pub transport: Option<TransportHandle>,
    pub resume_target: Option<String>,
}

impl Session {
    pub fn touch(&mut self) {
        self.last_active = Instant::now();
        self.last_active_at = SystemTime::now();
    }

    /// Whether a live transport is bound.
    pub fn is_bound(&self) -> bool {
        self.transport.as_ref().is_some_and(TransportHandle::is_open)
    }

    /// Resize the PTY and remember the dimensions. Failures are logged.
    pub fn apply_resize(&mut self, cols: u16, rows: u16) -> bool {
        self.touch();
        match self.pty.resize(cols, rows) {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %self.key, cols, rows, error = %e, "resize failed");
                false
            }
        }
    }

    pub fn status(&self) -> SessionStatus {
        let (cols, rows) = self.pty.size();
        SessionStatus {
            key: self.key.clone(),
            project_path: Some(self.project_path.to_string_lossy().into_owned()),
            exists: true,
            bound: self.is_bound(),
            transport_id: self
                .transport
                .as_ref()
                .filter(|t| t.is_open())
                .map(TransportHandle::id),
            created_at: Some(unix_millis(self.created_at)),
            last_active_at: Some(unix_millis(self.last_active_at)),
            idle_secs: Some(self.last_active.elapsed().as_secs()),
            process_id: self.pty.pid(),
            buffer_length: self.output.len(),
            cols: Some(cols),
            rows: Some(rows),
            resume_target: self.resume_target.clone(),
        }
    }
}

/// Observability snapshot of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub key: String,
    pub project_path: Option<String>,
    pub exists: bool,
    pub bound: bool,
    pub transport_id: Option<u64>,
    /// Unix milliseconds.
    pub created_at: Option<u64>,
    /// Unix milliseconds.
    pub last_active_at: Option<u64>,
    pub idle_secs: Option<u64>,
    pub process_id: Option<u32>,
    pub buffer_length: usize,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub resume_target: Option<String>,
}

impl SessionStatus {
    fn absent(key: &str) -> Self {
        Self {
            key: key.to_string(),
            project_path: None,
            exists: false,
            bound: false,
            transport_id: None,
            created_at: None,
            last_active_at: None,
            idle_secs: None,
            process_id: None,
            buffer_length: 0,
            cols: None,
            rows: None,
            resume_target: None,
        }
    }
}

type SessionMap = Arc<RwLock<HashMap<String, Session>>>;

/// Owns every persistent session.
pub struct SessionRegistry {
    sessions: SessionMap,
    settings: RegistrySettings,
    interceptor: Arc<UrlInterceptor>,
    next_generation: AtomicU64,
    /// Per-key creation locks, present only while someone is creating.
    creating: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SessionRegistry {
    pub fn new(settings: RegistrySettings) -> RelayResult<Self> {
        Ok(Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            settings,
            interceptor: Arc::new(UrlInterceptor::new()?),
            next_generation: AtomicU64::new(1),
            creating: Mutex::new(HashMap::new()),
        })
    }

    /// Return the project's session, spawning it if needed.
    ///
    /// An existing session is resized when the requested dimensions differ;
    /// its resume target is never changed. The boolean is `true` when a new
    /// process was spawned.
    pub async fn get_or_create(
        &self,
        project_path: &Path,
        resume_target: Option<&str>,
        cols: u16,
        rows: u16,
    ) -> RelayResult<(SessionStatus, bool)> {
        let project_path = normalize_project_path(project_path);
        let key = session_key(&project_path);

        let lock = self.creation_lock(&key);
        let guard = lock.lock().await;
        let result = self
            .create_locked(&key, &project_path, resume_target, cols, rows)
            .await;
        drop(guard);
        self.release_creation_lock(&key, lock);
        result
    }

    async fn create_locked(
        &self,
        key: &str,
        project_path: &Path,
        resume_target: Option<&str>,
        cols: u16,
        rows: u16,
    ) -> RelayResult<(SessionStatus, bool)> {
        {
            let mut sessions = self.sessions.write().await;
            if let Some(session) = sessions.get_mut(key) {
                if session.pty.size() != (cols, rows) {
                    session.apply_resize(cols, rows);
                }
                debug!(key = %key, "reusing session");
                return Ok((session.status(), false));
            }
            self.check_capacity(sessions.len())?;
        }

        let spec = self
            .settings
            .shell
            .persistent_spec(project_path, resume_target, cols, rows);
        let (pty, events) = PtyHandle::spawn_async(spec).await?;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let now = SystemTime::now();
        let session = Session {
            key: key.to_string(),
            project_path: project_path.to_path_buf(),
            generation,
            pty,
            output: OutputBuffer::new(
                self.settings.buffer_max_entries,
                self.settings.buffer_trim_to,
            ),
            created_at: now,
            last_active: Instant::now(),
            last_active_at: now,
            transport: None,
            resume_target: resume_target.map(str::to_string),
        };

        let mut sessions = self.sessions.write().await;
        // Other keys may have filled the registry while we were spawning.
        // Dropping the session kills its process.
        self.check_capacity(sessions.len())?;
        let status = session.status();
        sessions.insert(key.to_string(), session);
        drop(sessions);

        info!(
            key = %key,
            project = %project_path.display(),
            pid = ?status.process_id,
            resume = ?resume_target,
            "session created"
        );

        tokio::spawn(pump_output(
            self.sessions.clone(),
            self.interceptor.clone(),
            key.to_string(),
            generation,
            events,
        ));

        Ok((status, true))
    }

    fn check_capacity(&self, current: usize) -> RelayResult<()> {
        if current >= self.settings.max_sessions {
            return Err(RelayError::Spawn(format!(
                "max sessions ({}) reached",
                self.settings.max_sessions
            )));
        }
        Ok(())
    }

    fn creation_lock(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut creating = self.creating.lock().unwrap_or_else(PoisonError::into_inner);
        creating.entry(key.to_string()).or_default().clone()
    }

    fn release_creation_lock(&self, key: &str, lock: Arc<AsyncMutex<()>>) {
        let mut creating = self.creating.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map and `lock` itself hold it: nobody else is waiting.
        if Arc::strong_count(&lock) == 2 {
            creating.remove(key);
        }
    }

    /// Kill a project's session. See [`SessionRegistry::kill_key`].
    pub async fn kill(&self, project_path: &Path, force: bool) -> bool {
        self.kill_key(&session_key(project_path), force).await
    }

    /// Kill a session by key.
    ///
    /// The entry is removed immediately so the exiting process accepts no
    /// new attaches. `force` kills at once; otherwise `exit` is typed into
    /// the shell and a force kill follows after the grace period unless the
    /// process exits first. Returns whether a session existed.
    pub async fn kill_key(&self, key: &str, force: bool) -> bool {
        let removed = self.sessions.write().await.remove(key);
        let Some(session) = removed else {
            debug!(key, "kill of unknown session ignored");
            return false;
        };

        if let Some(transport) = &session.transport {
            transport.send(ServerMessage::output(
                "\r\n\x1b[33mSession terminated\x1b[0m\r\n",
            ));
            transport.close("session killed");
        }

        let pty = session.pty;
        if force {
            info!(key, pid = ?pty.pid(), "force-killing session");
            if let Err(e) = pty.kill() {
                warn!(key, error = %e, "force kill failed");
            }
            return true;
        }

        info!(key, pid = ?pty.pid(), "gracefully stopping session");
        if let Err(e) = pty.write(b"exit\n") {
            debug!(key, error = %e, "could not send exit, process already gone");
        }
        let grace = self.settings.kill_grace;
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::select! {
                code = pty.wait_exit() => {
                    debug!(key = %key, code, "session exited within grace period");
                }
                _ = tokio::time::sleep(grace) => {
                    warn!(key = %key, grace_secs = grace.as_secs_f64(), "graceful exit timed out, forcing");
                    if let Err(e) = pty.kill() {
                        warn!(key = %key, error = %e, "force kill failed");
                    }
                }
            }
        });
        true
    }

    pub async fn status(&self, project_path: &Path) -> SessionStatus {
        self.status_key(&session_key(project_path)).await
    }

    pub async fn status_key(&self, key: &str) -> SessionStatus {
        let sessions = self.sessions.read().await;
        sessions
            .get(key)
            .map(Session::status)
            .unwrap_or_else(|| SessionStatus::absent(key))
    }

    /// Status of every session.
    pub async fn list(&self) -> Vec<SessionStatus> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<SessionStatus> = sessions.values().map(Session::status).collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Access a session mutably via a callback (holds write lock).
    pub async fn with_session_mut<F, R>(&self, key: &str, f: F) -> RelayResult<R>
    where
        F: FnOnce(&mut Session) -> RelayResult<R>,
    {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(key)
            .ok_or_else(|| RelayError::SessionNotFound(key.to_string()))?;
        f(session)
    }

    /// Access a session immutably via a callback (holds read lock).
    #[cfg(test)]
    pub async fn with_session<F, R>(&self, key: &str, f: F) -> RelayResult<R>
    where
        F: FnOnce(&Session) -> RelayResult<R>,
    {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(key)
            .ok_or_else(|| RelayError::SessionNotFound(key.to_string()))?;
        f(session)
    }

    /// Force-kill and evict sessions that are unbound and idle for longer
    /// than `idle_threshold`. Bound sessions are never reclaimed.
    ///
    /// Returns the keys of reclaimed sessions.
    pub async fn reap_idle(&self, idle_threshold: Duration) -> Vec<String> {
        let mut sessions = self.sessions.write().await;
        let stale: Vec<String> = sessions
            .values()
            .filter(|s| !s.is_bound() && s.last_active.elapsed() > idle_threshold)
            .map(|s| s.key.clone())
            .collect();

        for key in &stale {
            if let Some(session) = sessions.remove(key) {
                warn!(
                    key = %key,
                    idle_secs = session.last_active.elapsed().as_secs(),
                    "reclaiming idle session"
                );
                if let Err(e) = session.pty.kill() {
                    warn!(key = %key, error = %e, "kill of idle session failed");
                }
            }
        }

        if !stale.is_empty() {
            debug!(count = stale.len(), "idle sweep removed sessions");
        }
        stale
    }

    /// Force-kill every session. Called on server shutdown.
    pub async fn shutdown(&self) {
        let drained: Vec<Session> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        info!(count = drained.len(), "killing all sessions");
        for session in drained {
            if let Some(transport) = &session.transport {
                transport.close("server shutting down");
            }
            if let Err(e) = session.pty.kill() {
                warn!(key = %session.key, error = %e, "kill on shutdown failed");
            }
        }
    }
}

/// Move PTY output into the session until the process exits, then evict it.
async fn pump_output(
    sessions: SessionMap,
    interceptor: Arc<UrlInterceptor>,
    key: String,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<PtyEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            PtyEvent::Data(chunk) => {
                let mut sessions = sessions.write().await;
                match sessions.get_mut(&key) {
                    Some(session) if session.generation == generation => {
                        session.deliver_output(chunk, &interceptor);
                    }
                    // Killed; keep draining until exit.
                    _ => {}
                }
            }
            PtyEvent::Exit { code } => {
                let mut sessions = sessions.write().await;
                let current = sessions
                    .get(&key)
                    .is_some_and(|s| s.generation == generation);
                if current {
                    if let Some(session) = sessions.remove(&key) {
                        info!(key = %key, code, "session process exited");
                        if let Some(transport) = &session.transport {
                            transport.send(ServerMessage::output(format!(
                                "\r\n\x1b[33mProcess exited with code {code}\x1b[0m\r\n"
                            )));
                        }
                    }
                }
                break;
            }
        }
    }
}

fn unix_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;
    use crate::session::pty::tests::{process_alive, wait_until_dead};
    use std::time::Duration;

    pub(crate) fn test_settings(assistant_command: &str) -> RegistrySettings {
        RegistrySettings {
            max_sessions: 4,
            buffer_max_entries: 1000,
            buffer_trim_to: 800,
            kill_grace: Duration::from_millis(500),
            shell: ShellSettings {
                shell: "/bin/sh".into(),
                assistant_command: assistant_command.into(),
                resume_flag: "--resume".into(),
                env: HashMap::from([("PS1".to_string(), "$ ".to_string())]),
            },
        }
    }

    pub(crate) fn test_registry() -> SessionRegistry {
        SessionRegistry::new(test_settings("/bin/sh")).unwrap()
    }

    async fn wait_until_absent(registry: &SessionRegistry, path: &Path) {
        for _ in 0..200 {
            if !registry.status(path).await.exists {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("session for {} never went away", path.display());
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry();

        let (first, is_new) = registry.get_or_create(dir.path(), None, 80, 24).await.unwrap();
        assert!(is_new);
        let (second, is_new) = registry.get_or_create(dir.path(), None, 80, 24).await.unwrap();
        assert!(!is_new);
        assert_eq!(first.process_id, second.process_id);
        assert_eq!(registry.count().await, 1);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_creates_spawn_once() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry();

        let (a, b) = tokio::join!(
            registry.get_or_create(dir.path(), None, 80, 24),
            registry.get_or_create(dir.path(), None, 80, 24),
        );
        let (a, a_new) = a.unwrap();
        let (b, b_new) = b.unwrap();
        assert!(a_new ^ b_new);
        assert_eq!(a.process_id, b.process_id);
        assert_eq!(registry.count().await, 1);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn reuse_applies_new_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry();

        registry.get_or_create(dir.path(), Some("abc"), 80, 24).await.unwrap();
        let (status, is_new) = registry
            .get_or_create(dir.path(), Some("other"), 132, 50)
            .await
            .unwrap();
        assert!(!is_new);
        assert_eq!((status.cols, status.rows), (Some(132), Some(50)));
        assert_eq!(status.resume_target.as_deref(), Some("abc"));

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn spawn_error_leaves_no_entry() {
        let registry = test_registry();
        let missing = Path::new("/no/such/project/dir");
        let err = registry.get_or_create(missing, None, 80, 24).await.unwrap_err();
        assert!(matches!(err, RelayError::Spawn(_)));
        assert!(!registry.status(missing).await.exists);
    }

    #[tokio::test]
    async fn max_sessions_is_enforced() {
        let registry = test_registry();
        let dirs: Vec<_> = (0..5).map(|_| tempfile::tempdir().unwrap()).collect();
        for dir in &dirs[..4] {
            registry.get_or_create(dir.path(), None, 80, 24).await.unwrap();
        }
        let err = registry.get_or_create(dirs[4].path(), None, 80, 24).await.unwrap_err();
        assert!(matches!(err, RelayError::Spawn(_)));

        registry.shutdown().await;
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn kill_is_idempotent_and_immediate() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry();

        assert!(!registry.kill(dir.path(), true).await);

        let (first, _) = registry.get_or_create(dir.path(), None, 80, 24).await.unwrap();
        assert!(registry.kill(dir.path(), false).await);
        assert!(!registry.status(dir.path()).await.exists);
        assert!(!registry.kill(dir.path(), false).await);

        // a later create spawns a fresh process
        let (second, is_new) = registry.get_or_create(dir.path(), None, 80, 24).await.unwrap();
        assert!(is_new);
        assert_ne!(first.process_id, second.process_id);
        assert!(registry.kill_key(&second.key, true).await);
        assert_eq!(registry.count().await, 0);
    }

    const IGNORES_HANGUP: &str = r#"sh -c "trap '' HUP INT TERM; while :; do sleep 1; done""#;

    #[tokio::test]
    async fn graceful_kill_escalates_when_exit_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(test_settings(IGNORES_HANGUP)).unwrap();
        let (status, _) = registry.get_or_create(dir.path(), None, 80, 24).await.unwrap();
        let pid = status.process_id.unwrap();

        assert!(registry.kill(dir.path(), false).await);
        assert!(!registry.status(dir.path()).await.exists);

        // still inside the 500 ms grace period
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(process_alive(pid));

        assert!(
            wait_until_dead(pid, Duration::from_secs(5)).await,
            "process {pid} survived the forced kill"
        );
    }

    #[tokio::test]
    async fn force_kill_ignores_hangup_traps() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(test_settings(IGNORES_HANGUP)).unwrap();
        let (status, _) = registry.get_or_create(dir.path(), None, 80, 24).await.unwrap();
        let pid = status.process_id.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(registry.kill(dir.path(), true).await);
        assert!(wait_until_dead(pid, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn creation_does_not_block_other_projects() {
        let registry = test_registry();
        let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();

        let (a, b, c) = tokio::join!(
            registry.get_or_create(dirs[0].path(), None, 80, 24),
            registry.get_or_create(dirs[1].path(), None, 80, 24),
            registry.get_or_create(dirs[2].path(), None, 80, 24),
        );
        let pids: Vec<_> = [a, b, c]
            .into_iter()
            .map(|r| r.unwrap().0.process_id)
            .collect();
        assert_eq!(registry.count().await, 3);
        assert!(pids[0] != pids[1] && pids[1] != pids[2]);
        // locks are dropped once nobody is creating
        assert!(registry.creating.lock().unwrap().is_empty());

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn kill_closes_bound_transport() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry();
        let (status, _) = registry.get_or_create(dir.path(), None, 80, 24).await.unwrap();
        let (transport, mut rx) = TransportHandle::new();
        registry
            .with_session_mut(&status.key, |s| {
                s.transport = Some(transport);
                Ok(())
            })
            .await
            .unwrap();

        registry.kill(dir.path(), true).await;

        let mut closed = false;
        while let Ok(item) = rx.try_recv() {
            if matches!(item, crate::transport::Outbound::Close { .. }) {
                closed = true;
            }
        }
        assert!(closed);
    }

    #[tokio::test]
    async fn process_exit_evicts_session() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(test_settings("exit 0")).unwrap();
        let (_, is_new) = registry.get_or_create(dir.path(), None, 80, 24).await.unwrap();
        assert!(is_new);
        wait_until_absent(&registry, dir.path()).await;
    }

    #[tokio::test]
    async fn reaper_spares_bound_sessions() {
        let idle_dir = tempfile::tempdir().unwrap();
        let bound_dir = tempfile::tempdir().unwrap();
        let registry = test_registry();

        let (idle, _) = registry.get_or_create(idle_dir.path(), None, 80, 24).await.unwrap();
        let (bound, _) = registry.get_or_create(bound_dir.path(), None, 80, 24).await.unwrap();
        let (transport, _rx) = TransportHandle::new();
        registry
            .with_session_mut(&bound.key, |s| {
                s.transport = Some(transport);
                Ok(())
            })
            .await
            .unwrap();

        // nothing is idle for an hour yet
        assert!(registry.reap_idle(Duration::from_secs(3600)).await.is_empty());

        tokio::time::sleep(Duration::from_millis(30)).await;
        let reaped = registry.reap_idle(Duration::from_millis(10)).await;
        assert_eq!(reaped, vec![idle.key.clone()]);
        assert!(!registry.status_key(&idle.key).await.exists);
        assert!(registry.status_key(&bound.key).await.exists);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn status_of_unknown_project() {
        let registry = test_registry();
        let status = registry.status(Path::new("/nowhere")).await;
        assert!(!status.exists);
        assert!(!status.bound);
        assert_eq!(status.key, session_key(Path::new("/nowhere")));
        assert!(registry.list().await.is_empty());
    }
}
