//! # Session Pools
//!
//! Purpose: Decide when a transport session is built, reused and closed.
//!
//! ## Design Principles
//! 1. **Strategy Pattern**: Three interchangeable policies behind one trait:
//!    ephemeral, shared-cache and per-context cache.
//! 2. **RAII Leases**: A checkout returns a `Lease`; dropping it performs the
//!    policy's release action on every exit path, cancellation included.
//! 3. **Minimal Locking**: Cache maps are locked only for the synchronous
//!    check-construct-store step. Sessions connect lazily, so nothing is
//!    awaited under a lock.
//! 4. **Close Once**: Closing swaps the storage out first, so every session
//!    is closed exactly once no matter how often `close` is called.
//! 5. **Thread Lifetime**: A per-context cache lives as long as its thread;
//!    thread exit removes and closes it.
//!
//! ## Layout
//!
//! ```text
//! PerContextCache
//!   └── ThreadId -> SharedCache
//!                     ├── Direct(HostKey)   -> Arc<dyn Session>
//!                     └── Proxied(ProxyKey) -> Arc<dyn Session>
//! ```

use std::cell::RefCell;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::debug;

use hbridge_common::{BridgeError, BridgeResult, Endpoint, HostKey, ProxyKey, SessionOptions};
use hbridge_transport::{Http1Session, Session};

/// Builds the session for an endpoint. Replaces the default HTTP/1.1 session.
pub type SessionFactory = Arc<dyn Fn(&Endpoint, &SessionOptions) -> BridgeResult<Arc<dyn Session>> + Send + Sync>;

/// Post-processes every newly built session, e.g. to add middleware.
pub type SessionDecorator = Arc<dyn Fn(Arc<dyn Session>) -> Arc<dyn Session> + Send + Sync>;

/// Builds pools; lets callers replace the default pooling policy.
pub type PoolFactory = Arc<dyn Fn(PoolOptions) -> Arc<dyn SessionPool> + Send + Sync>;

/// Resolves sessions for endpoints under one pooling policy.
pub trait SessionPool: Send + Sync {
    /// Returns a session bound to `endpoint`.
    fn checkout(&self, endpoint: &Endpoint) -> BridgeResult<Lease>;

    /// Returns a session reaching `endpoint` through the proxy at `proxy`.
    fn checkout_proxied(&self, proxy: &Endpoint, endpoint: &Endpoint) -> BridgeResult<Lease>;

    /// Closes every session the pool holds. Idempotent.
    fn close(&self);
}

/// Session construction settings shared by every policy.
#[derive(Clone, Default)]
pub struct PoolOptions {
    pub session: SessionOptions,
    pub factory: Option<SessionFactory>,
    pub decorator: Option<SessionDecorator>,
}

impl PoolOptions {
    pub fn new(session: SessionOptions) -> Self {
        PoolOptions {
            session,
            factory: None,
            decorator: None,
        }
    }

    pub fn with_factory(mut self, factory: SessionFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_decorator(mut self, decorator: SessionDecorator) -> Self {
        self.decorator = Some(decorator);
        self
    }

    /// Builds and decorates a session for `endpoint`.
    fn build(&self, endpoint: &Endpoint) -> BridgeResult<Arc<dyn Session>> {
        let session: Arc<dyn Session> = match &self.factory {
            Some(factory) => factory(endpoint, &self.session)?,
            None => Arc::new(Http1Session::new(endpoint, self.session.clone())),
        };
        debug!(endpoint = %endpoint.host_key(), "session created");
        Ok(match &self.decorator {
            Some(decorate) => decorate(session),
            None => session,
        })
    }
}

impl fmt::Debug for PoolOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolOptions")
            .field("session", &self.session)
            .field("factory", &self.factory.is_some())
            .field("decorator", &self.decorator.is_some())
            .finish()
    }
}

/// Scoped acquisition of a session.
///
/// Shared leases leave the session in its pool; owned leases close their
/// sessions when dropped.
pub struct Lease {
    session: Arc<dyn Session>,
    owned: Vec<Arc<dyn Session>>,
}

impl Lease {
    /// A lease on a session that stays in its pool.
    pub fn shared(session: Arc<dyn Session>) -> Self {
        Lease {
            session,
            owned: Vec::new(),
        }
    }

    /// A lease that closes `session` and then `also_close` on drop.
    pub fn owned(session: Arc<dyn Session>, also_close: Vec<Arc<dyn Session>>) -> Self {
        let mut owned = Vec::with_capacity(also_close.len() + 1);
        owned.push(session.clone());
        owned.extend(also_close);
        Lease { session, owned }
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }
}

impl Deref for Lease {
    type Target = dyn Session;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("session", &self.session)
            .field("owned", &!self.owned.is_empty())
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        for session in self.owned.drain(..) {
            session.close();
        }
    }
}

/// Builds a fresh session per checkout and closes it when the lease drops.
#[derive(Debug)]
pub struct EphemeralPool {
    options: PoolOptions,
    closed: AtomicBool,
}

impl EphemeralPool {
    pub fn new(options: PoolOptions) -> Self {
        EphemeralPool {
            options,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> BridgeResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BridgeError::PoolClosed);
        }
        Ok(())
    }
}

impl SessionPool for EphemeralPool {
    fn checkout(&self, endpoint: &Endpoint) -> BridgeResult<Lease> {
        self.ensure_open()?;
        Ok(Lease::owned(self.options.build(endpoint)?, Vec::new()))
    }

    fn checkout_proxied(&self, proxy: &Endpoint, endpoint: &Endpoint) -> BridgeResult<Lease> {
        self.ensure_open()?;
        let proxy_session = self.options.build(proxy)?;
        let session = match proxy_session.proxied(endpoint) {
            Ok(session) => session,
            Err(err) => {
                proxy_session.close();
                return Err(err.into());
            }
        };
        Ok(Lease::owned(session, vec![proxy_session]))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Direct(HostKey),
    Proxied(ProxyKey),
}

type SessionMap = HashMap<CacheKey, Arc<dyn Session>, RandomState>;

struct CacheState {
    sessions: SessionMap,
    closed: bool,
}

/// One session per host key (or proxy/target pair), reused until closed.
pub struct SharedCache {
    options: PoolOptions,
    state: Mutex<CacheState>,
}

impl SharedCache {
    pub fn new(options: PoolOptions) -> Self {
        SharedCache {
            options,
            state: Mutex::new(CacheState {
                sessions: HashMap::with_hasher(RandomState::new()),
                closed: false,
            }),
        }
    }

    /// Number of cached sessions, direct and proxied.
    pub fn len(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, key: CacheKey, build: impl FnOnce(&mut SessionMap) -> BridgeResult<Arc<dyn Session>>) -> BridgeResult<Arc<dyn Session>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(BridgeError::PoolClosed);
        }
        if let Some(session) = state.sessions.get(&key) {
            debug!(key = ?key, "session cache hit");
            return Ok(session.clone());
        }

        debug!(key = ?key, "session cache miss");
        let session = build(&mut state.sessions)?;
        state.sessions.insert(key, session.clone());
        Ok(session)
    }

    fn direct(&self, sessions: &mut SessionMap, endpoint: &Endpoint) -> BridgeResult<Arc<dyn Session>> {
        let key = CacheKey::Direct(endpoint.host_key());
        if let Some(session) = sessions.get(&key) {
            return Ok(session.clone());
        }
        let session = self.options.build(endpoint)?;
        sessions.insert(key, session.clone());
        Ok(session)
    }
}

impl SessionPool for SharedCache {
    fn checkout(&self, endpoint: &Endpoint) -> BridgeResult<Lease> {
        let key = CacheKey::Direct(endpoint.host_key());
        let session = self.lookup(key, |_| self.options.build(endpoint))?;
        Ok(Lease::shared(session))
    }

    fn checkout_proxied(&self, proxy: &Endpoint, endpoint: &Endpoint) -> BridgeResult<Lease> {
        let key = CacheKey::Proxied(ProxyKey::new(proxy, endpoint));
        let session = self.lookup(key, |sessions| {
            // The proxy's own session comes from the same cache.
            let proxy_session = self.direct(sessions, proxy)?;
            Ok(proxy_session.proxied(endpoint)?)
        })?;
        Ok(Lease::shared(session))
    }

    fn close(&self) {
        let sessions = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::replace(&mut state.sessions, HashMap::with_hasher(RandomState::new()))
        };
        if !sessions.is_empty() {
            debug!(count = sessions.len(), "closing cached sessions");
        }
        for (_, session) in sessions {
            session.close();
        }
    }
}

impl fmt::Debug for SharedCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SharedCache")
            .field("sessions", &state.sessions.len())
            .field("closed", &state.closed)
            .finish()
    }
}

struct ContextState {
    caches: HashMap<ThreadId, Arc<SharedCache>, RandomState>,
    closed: bool,
}

/// Removes one thread's cache from its pool when that thread exits.
struct ThreadExit {
    thread: ThreadId,
    pool: Weak<Mutex<ContextState>>,
}

impl Drop for ThreadExit {
    fn drop(&mut self) {
        let Some(state) = self.pool.upgrade() else {
            return;
        };
        let cache = state.lock().caches.remove(&self.thread);
        if let Some(cache) = cache {
            debug!(thread = ?self.thread, "thread exited, closing its session cache");
            cache.close();
        }
    }
}

thread_local! {
    static THREAD_EXITS: RefCell<Vec<ThreadExit>> = const { RefCell::new(Vec::new()) };
}

/// One `SharedCache` per OS thread, created on first use and closed when the
/// thread exits.
pub struct PerContextCache {
    options: PoolOptions,
    state: Arc<Mutex<ContextState>>,
}

impl PerContextCache {
    pub fn new(options: PoolOptions) -> Self {
        PerContextCache {
            options,
            state: Arc::new(Mutex::new(ContextState {
                caches: HashMap::with_hasher(RandomState::new()),
                closed: false,
            })),
        }
    }

    /// The cache belonging to the calling thread.
    pub fn current(&self) -> BridgeResult<Arc<SharedCache>> {
        let id = std::thread::current().id();
        let (cache, created) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(BridgeError::PoolClosed);
            }
            let mut created = false;
            let cache = state
                .caches
                .entry(id)
                .or_insert_with(|| {
                    debug!(thread = ?id, "creating per-thread session cache");
                    created = true;
                    Arc::new(SharedCache::new(self.options.clone()))
                })
                .clone();
            (cache, created)
        };
        if created {
            self.register_exit(id);
        }
        Ok(cache)
    }

    fn register_exit(&self, thread: ThreadId) {
        let exit = ThreadExit {
            thread,
            pool: Arc::downgrade(&self.state),
        };
        let registered = THREAD_EXITS.try_with(|exits| {
            let mut exits = exits.borrow_mut();
            exits.retain(|exit| exit.pool.strong_count() > 0);
            exits.push(exit);
        });
        if registered.is_err() {
            debug!(thread = ?thread, "thread is exiting, cache stays until close");
        }
    }

    /// Number of live threads that own a cache.
    pub fn contexts(&self) -> usize {
        self.state.lock().caches.len()
    }
}

impl SessionPool for PerContextCache {
    fn checkout(&self, endpoint: &Endpoint) -> BridgeResult<Lease> {
        self.current()?.checkout(endpoint)
    }

    fn checkout_proxied(&self, proxy: &Endpoint, endpoint: &Endpoint) -> BridgeResult<Lease> {
        self.current()?.checkout_proxied(proxy, endpoint)
    }

    fn close(&self) {
        let caches = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::replace(&mut state.caches, HashMap::with_hasher(RandomState::new()))
        };
        for (_, cache) in caches {
            cache.close();
        }
    }
}

impl fmt::Debug for PerContextCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PerContextCache")
            .field("contexts", &state.caches.len())
            .field("closed", &state.closed)
            .finish()
    }
}
