use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::remote::{RemoteShell, ShellConfig, ShellFactory};

/// Pool entries are keyed by cluster for shared-credential clusters and by
/// job for dedicated-credential clusters. A dedicated entry never outlives
/// its job; a shared entry lives as long as any job holds a reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PoolKey {
    Cluster(String),
    Job(String),
}

impl PoolKey {
    pub fn is_dedicated(&self) -> bool {
        matches!(self, PoolKey::Job(_))
    }
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolKey::Cluster(name) => write!(f, "cluster:{name}"),
            PoolKey::Job(id) => write!(f, "job:{id}"),
        }
    }
}

/// Retry schedule for connection establishment. The upstream squared-growth
/// schedule is replaced by doubling with a cap and a little jitter; the
/// cumulative budget bounds how long a worker keeps trying before the job is
/// declared unreachable.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub cap: Duration,
    pub budget: Duration,
    pub jitter_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            cap: Duration::from_secs(30),
            budget: Duration::from_secs(100),
            jitter_ms: 500,
        }
    }
}

struct Entry {
    shell: Arc<dyn RemoteShell>,
    refs: usize,
}

/// Refcounted table of live shell connections, owned by the supervisor.
pub struct ConnectionPool {
    entries: Mutex<HashMap<PoolKey, Entry>>,
    factory: Arc<dyn ShellFactory>,
    backoff: BackoffPolicy,
}

impl ConnectionPool {
    pub fn new(factory: Arc<dyn ShellFactory>, backoff: BackoffPolicy) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            factory,
            backoff,
        }
    }

    /// Pre-create a shared entry with refcount 0. Called once per
    /// shared-credential cluster at startup.
    pub async fn register(&self, key: PoolKey, config: ShellConfig) {
        let mut entries = self.entries.lock().await;
        entries.entry(key).or_insert_with(|| Entry {
            shell: self.factory.build(config),
            refs: 0,
        });
    }

    /// Increment the refcount, creating the entry if absent (dedicated keys
    /// are created here at job registration).
    pub async fn acquire(&self, key: &PoolKey, config: ShellConfig) -> Arc<dyn RemoteShell> {
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
            shell: self.factory.build(config),
            refs: 0,
        });
        entry.refs += 1;
        entry.shell.clone()
    }

    /// Decrement the refcount; at zero the connection is disposed and the
    /// entry removed. Dedicated entries are always disposed immediately.
    pub async fn release(&self, key: &PoolKey) {
        let removed = {
            let mut entries = self.entries.lock().await;
            match entries.get_mut(key) {
                Some(entry) => {
                    entry.refs = entry.refs.saturating_sub(1);
                    if entry.refs == 0 || key.is_dedicated() {
                        entries.remove(key)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some(entry) = removed {
            entry.shell.dispose().await;
        }
    }

    pub async fn refcount(&self, key: &PoolKey) -> Option<usize> {
        self.entries.lock().await.get(key).map(|e| e.refs)
    }

    /// Bring a shell up, retrying with capped backoff until the cumulative
    /// wait budget is spent. A connection only counts as usable once the
    /// liveness probe runs cleanly.
    pub async fn ensure_connected(
        &self,
        cluster: &str,
        shell: &Arc<dyn RemoteShell>,
    ) -> Result<()> {
        if shell.is_connected().await && probe(shell).await {
            return Ok(());
        }

        let mut wait = Duration::ZERO;
        let mut waited = Duration::ZERO;
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            match shell.connect().await {
                Ok(()) if probe(shell).await => return Ok(()),
                Ok(()) => {
                    tracing::warn!(cluster, attempts, "liveness probe failed after connect");
                }
                Err(err) => {
                    tracing::warn!(cluster, attempts, "connect attempt failed: {err}");
                }
            }

            wait = if wait.is_zero() {
                self.backoff.initial
            } else {
                (wait * 2).min(self.backoff.cap)
            };
            if waited + wait > self.backoff.budget {
                return Err(Error::Connectivity {
                    cluster: cluster.to_string(),
                    attempts,
                    waited_secs: waited.as_secs(),
                });
            }
            waited += wait;
            let jitter = Duration::from_millis(rand::rng().random_range(0..=self.backoff.jitter_ms));
            tokio::time::sleep(wait + jitter).await;
        }
    }
}

/// Trivial no-op remote command; the connection is not considered usable
/// until this succeeds.
async fn probe(shell: &Arc<dyn RemoteShell>) -> bool {
    matches!(shell.exec("echo ok").await, Ok(out) if out.ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::ExecOutput;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default)]
    struct FakeShell {
        fail_connects: AtomicU32,
        connect_calls: AtomicU32,
        connected: AtomicBool,
        disposed: AtomicBool,
    }

    impl FakeShell {
        fn failing(times: u32) -> Self {
            Self {
                fail_connects: AtomicU32::new(times),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl RemoteShell for FakeShell {
        async fn connect(&self) -> crate::Result<()> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_connects.load(Ordering::SeqCst) > 0 {
                self.fail_connects.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Transport(anyhow::anyhow!("refused")));
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn exec(&self, _cmd: &str) -> crate::Result<ExecOutput> {
            Ok(ExecOutput::default())
        }

        async fn put_file(&self, _content: &[u8], _remote_path: &str) -> crate::Result<()> {
            Ok(())
        }

        async fn put_directory(&self, _local: &Path, _remote: &str) -> crate::Result<()> {
            Ok(())
        }

        async fn make_dir(&self, _remote_dir: &str) -> crate::Result<()> {
            Ok(())
        }

        async fn dispose(&self) {
            self.disposed.store(true, Ordering::SeqCst);
        }
    }

    struct FakeFactory {
        built: std::sync::Mutex<Vec<Arc<FakeShell>>>,
        fail_connects: u32,
    }

    impl FakeFactory {
        fn new(fail_connects: u32) -> Self {
            Self {
                built: std::sync::Mutex::new(Vec::new()),
                fail_connects,
            }
        }

        fn last(&self) -> Arc<FakeShell> {
            self.built.lock().unwrap().last().unwrap().clone()
        }
    }

    impl ShellFactory for FakeFactory {
        fn build(&self, _config: ShellConfig) -> Arc<dyn RemoteShell> {
            let shell = Arc::new(FakeShell::failing(self.fail_connects));
            self.built.lock().unwrap().push(shell.clone());
            shell
        }
    }

    fn config() -> ShellConfig {
        ShellConfig {
            host: "head.example.org".into(),
            port: 22,
            credential: crate::store::Credential::Password {
                username: "svc".into(),
                password: "secret".into(),
            },
            keepalive_secs: 60,
        }
    }

    #[tokio::test]
    async fn shared_entries_are_refcounted() {
        let factory = Arc::new(FakeFactory::new(0));
        let pool = ConnectionPool::new(factory.clone(), BackoffPolicy::default());
        let key = PoolKey::Cluster("lumi".into());

        pool.register(key.clone(), config()).await;
        assert_eq!(pool.refcount(&key).await, Some(0));

        let a = pool.acquire(&key, config()).await;
        let b = pool.acquire(&key, config()).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.refcount(&key).await, Some(2));

        pool.release(&key).await;
        assert_eq!(pool.refcount(&key).await, Some(1));
        assert!(!factory.last().disposed.load(Ordering::SeqCst));

        pool.release(&key).await;
        assert_eq!(pool.refcount(&key).await, None);
        assert!(factory.last().disposed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn dedicated_entries_are_disposed_on_release() {
        let factory = Arc::new(FakeFactory::new(0));
        let pool = ConnectionPool::new(factory.clone(), BackoffPolicy::default());
        let key = PoolKey::Job("j9".into());

        let _shell = pool.acquire(&key, config()).await;
        assert_eq!(pool.refcount(&key).await, Some(1));

        pool.release(&key).await;
        assert_eq!(pool.refcount(&key).await, None);
        assert!(factory.last().disposed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_retries_then_succeeds() {
        let factory = Arc::new(FakeFactory::new(3));
        let pool = ConnectionPool::new(factory.clone(), BackoffPolicy::default());
        let shell = pool.acquire(&PoolKey::Cluster("lumi".into()), config()).await;

        pool.ensure_connected("lumi", &shell).await.unwrap();
        // Three failures plus the successful attempt.
        assert_eq!(factory.last().connect_calls.load(Ordering::SeqCst), 4);
        assert!(shell.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_budget_exhaustion_is_fatal() {
        let factory = Arc::new(FakeFactory::new(u32::MAX));
        let pool = ConnectionPool::new(factory.clone(), BackoffPolicy::default());
        let shell = pool.acquire(&PoolKey::Cluster("lumi".into()), config()).await;

        let err = pool.ensure_connected("lumi", &shell).await.unwrap_err();
        match err {
            Error::Connectivity { cluster, attempts, waited_secs } => {
                assert_eq!(cluster, "lumi");
                // 2+4+8+16+30+30 = 90s spent; the next 30s step would blow
                // the 100s budget.
                assert_eq!(waited_secs, 90);
                assert_eq!(attempts, 7);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
