use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut};
use thiserror::Error;
use tracing::{debug, warn};

use crate::request::Request;
use crate::types::Value;
use crate::unlang::{ReturnCode, SectionKind, VirtualServer};

/// Binary session key, visible to the policy in the request list.
pub const SESSION_ID_ATTR: &str = "TLS-Session-Id";
/// Serialized session blob, carried in session-state.
pub const SESSION_DATA_ATTR: &str = "TLS-Session-Data";
/// The action enum, carried in the control list.
pub const CACHE_ACTION_ATTR: &str = "TLS-Session-Cache-Action";
/// Per-user override checked before a session is allowed to be cached.
pub const ALLOW_RESUMPTION_ATTR: &str = "Allow-Session-Resumption";

pub const MAX_CACHE_ID_SIZE: usize = 256;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Session ID is larger than {MAX_CACHE_ID_SIZE} octets")]
    IdTooLarge,

    #[error("Truncated serialized session")]
    Truncated,
}

/// The action the policy is asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CacheAction {
    Read = 1,
    Write = 2,
    Delete = 3,
}

/// A TLS session as the library hands it to the callbacks. The blob in
/// `data` is opaque to the core; only the resumption metadata is
/// interpreted here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSession {
    pub id: Vec<u8>,
    pub data: Vec<u8>,
    pub timeout: Duration,
    /// Peer negotiated the Extended Master Secret extension.
    pub extms: bool,
    /// Negotiated cipher is forward secure.
    pub forward_secure: bool,
    pub allow_resumption: bool,
}

impl TlsSession {
    pub fn new(id: Vec<u8>, data: Vec<u8>, timeout: Duration) -> Self {
        Self {
            id,
            data,
            timeout,
            extms: true,
            forward_secure: true,
            allow_resumption: true,
        }
    }

    /// Serialize for the cache blob: id and data, length-prefixed, plus
    /// the timeout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.id.len() + self.data.len() + 12);
        buf.put_u16(self.id.len() as u16);
        buf.put_slice(&self.id);
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
        buf.put_u64(self.timeout.as_secs());
        buf
    }

    pub fn from_bytes(mut raw: &[u8]) -> Result<Self, CacheError> {
        if raw.remaining() < 2 {
            return Err(CacheError::Truncated);
        }
        let id_len = raw.get_u16() as usize;
        if raw.remaining() < id_len {
            return Err(CacheError::Truncated);
        }
        let id = raw[..id_len].to_vec();
        raw.advance(id_len);

        if raw.remaining() < 4 {
            return Err(CacheError::Truncated);
        }
        let data_len = raw.get_u32() as usize;
        if raw.remaining() < data_len {
            return Err(CacheError::Truncated);
        }
        let data = raw[..data_len].to_vec();
        raw.advance(data_len);

        if raw.remaining() < 8 {
            return Err(CacheError::Truncated);
        }
        let timeout = Duration::from_secs(raw.get_u64());

        Ok(Self::new(id, data, timeout))
    }
}

/// Re-validates the client certificate chain when a session is resumed.
pub trait ChainValidator: Send + Sync {
    fn validate(&self, request: &Request, session: &TlsSession) -> bool;
}

/// Deployment default when no chain validation is configured.
pub struct AcceptAllChains;

impl ChainValidator for AcceptAllChains {
    fn validate(&self, _request: &Request, _session: &TlsSession) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct SessionCacheConfig {
    pub enabled: bool,
    /// Scopes sessions to the component that created them, so sessions
    /// from one EAP module cannot be resumed by another.
    pub session_id_context: String,
    pub lifetime: Duration,
    pub require_extms: bool,
    pub require_pfs: bool,
}

impl Default for SessionCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            session_id_context: "radiusd".to_string(),
            lifetime: Duration::from_secs(24 * 3600),
            require_extms: false,
            require_pfs: false,
        }
    }
}

/// Bridges the TLS library's new/get/remove session callbacks into the
/// configured virtual server.
pub struct SessionCache {
    config: SessionCacheConfig,
    server: Arc<VirtualServer>,
    validator: Arc<dyn ChainValidator>,
}

impl SessionCache {
    pub fn new(
        config: SessionCacheConfig,
        server: Arc<VirtualServer>,
        validator: Arc<dyn ChainValidator>,
    ) -> Self {
        Self {
            config,
            server,
            validator,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// The context string under which the library should store sessions.
    pub fn session_id_context(&self) -> &str {
        &self.config.session_id_context
    }

    pub fn lifetime(&self) -> Duration {
        self.config.lifetime
    }

    fn set_attrs(&self, request: &mut Request, key: &[u8], action: CacheAction) {
        debug!("Setting TLS cache control attributes");

        request.packet.remove_all(SESSION_ID_ATTR);
        request
            .packet
            .push(SESSION_ID_ATTR, Value::Octets(key.to_vec()));
        request
            .control
            .replace(CACHE_ACTION_ATTR, Value::Uint32(action as u32));
    }

    /// Remove everything the call added; the session data must not be
    /// observable outside the virtual-server invocation.
    fn strip_attrs(&self, request: &mut Request) {
        request.packet.remove_all(SESSION_ID_ATTR);
        request.control.remove_all(CACHE_ACTION_ATTR);
        request.session_state.remove_all(SESSION_DATA_ATTR);
    }

    async fn run_policy(&self, request: &mut Request) -> ReturnCode {
        self.server
            .run(SectionKind::Authorize, None, request)
            .await
    }

    /// The library created a new session; hand it to the `write` policy.
    pub async fn write(&self, request: &mut Request, session: &TlsSession) {
        if session.id.len() > MAX_CACHE_ID_SIZE {
            warn!("Session ID buffer too small");
            return;
        }

        self.set_attrs(request, &session.id, CacheAction::Write);
        request
            .session_state
            .replace(SESSION_DATA_ATTR, Value::Octets(session.to_bytes()));

        match self.run_policy(request).await {
            ReturnCode::Ok | ReturnCode::Updated => {}
            code => {
                warn!(%code, "Failed storing session data");
            }
        }

        self.strip_attrs(request);
    }

    /// The library wants a cached session for `key`. An unknown key is
    /// "no cached session", not an error.
    pub async fn read(&self, request: &mut Request, key: &[u8]) -> Option<TlsSession> {
        self.set_attrs(request, key, CacheAction::Read);

        let rcode = self.run_policy(request).await;
        let session = match rcode {
            ReturnCode::Ok | ReturnCode::Updated => {
                match request.session_state.get(SESSION_DATA_ATTR) {
                    Some(Value::Octets(raw)) => match TlsSession::from_bytes(raw) {
                        Ok(session) => Some(session),
                        Err(err) => {
                            warn!(%err, "Failed loading persisted session");
                            None
                        }
                    },
                    _ => {
                        debug!("No cached session found");
                        None
                    }
                }
            }
            code => {
                debug!(%code, "Failed acquiring session data");
                None
            }
        };

        self.strip_attrs(request);

        let mut session = session?;

        // A resumed session still has to present a valid certificate
        // chain. On failure the session is returned with a zero timeout
        // so the library will not offer it again.
        if !self.validator.validate(request, &session) {
            warn!("Validation failed, forcefully expiring resumed session");
            session.timeout = Duration::ZERO;
        }

        Some(session)
    }

    /// The library dropped a session; tell the `delete` policy. Deleting
    /// an unknown session is tolerated.
    pub async fn delete(&self, request: &mut Request, key: &[u8]) {
        self.set_attrs(request, key, CacheAction::Delete);

        match self.run_policy(request).await {
            ReturnCode::Ok | ReturnCode::Updated | ReturnCode::NotFound | ReturnCode::Noop => {}
            code => {
                warn!(%code, "Failed deleting session data");
            }
        }

        self.strip_attrs(request);
    }

    /// Callback the library asks before caching a session at all.
    /// Returning false also means any existing cache entry is dropped.
    pub fn allow_resumption(&self, request: &Request, session: &TlsSession) -> bool {
        if self.config.require_extms && !session.extms {
            debug!(
                "Client does not support the Extended Master Secret extension, \
                 disabling session resumption"
            );
            return false;
        }

        if self.config.require_pfs && !session.forward_secure {
            debug!("Cipher suite is not forward secure, disabling session resumption");
            return false;
        }

        if !session.allow_resumption {
            return false;
        }

        if let Some(Value::Bool(false)) = request.control.get(ALLOW_RESUMPTION_ATTR) {
            debug!("&control:Allow-Session-Resumption == no, disabling session resumption");
            return false;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::module::{MapRegistry, Module, ModuleRegistry};
    use crate::unlang::{parse_section, CompileCtx, Dictionary, PolicyCatalog};

    use super::*;

    /// An in-memory cache policy: stores blobs keyed by session id.
    struct MemoryCacheModule {
        store: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    }

    impl MemoryCacheModule {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                store: Mutex::new(HashMap::new()),
            })
        }
    }

    #[async_trait]
    impl Module for MemoryCacheModule {
        fn name(&self) -> &str {
            "cache_store"
        }

        async fn invoke(&self, _method: SectionKind, request: &mut Request) -> ReturnCode {
            let Some(Value::Octets(key)) = request.packet.get(SESSION_ID_ATTR) else {
                return ReturnCode::Invalid;
            };
            let key = key.clone();
            let action = request
                .control
                .get(CACHE_ACTION_ATTR)
                .and_then(|v| v.as_u32());

            let mut store = self.store.lock().unwrap();
            match action {
                Some(a) if a == CacheAction::Write as u32 => {
                    let Some(Value::Octets(blob)) = request.session_state.get(SESSION_DATA_ATTR)
                    else {
                        return ReturnCode::Invalid;
                    };
                    store.insert(key, blob.clone());
                    ReturnCode::Ok
                }
                Some(a) if a == CacheAction::Read as u32 => match store.get(&key) {
                    Some(blob) => {
                        request
                            .session_state
                            .replace(SESSION_DATA_ATTR, Value::Octets(blob.clone()));
                        ReturnCode::Ok
                    }
                    None => ReturnCode::NotFound,
                },
                Some(a) if a == CacheAction::Delete as u32 => match store.remove(&key) {
                    Some(_) => ReturnCode::Ok,
                    None => ReturnCode::NotFound,
                },
                _ => ReturnCode::Invalid,
            }
        }
    }

    fn cache_server(module: Arc<MemoryCacheModule>) -> Arc<VirtualServer> {
        let mut modules = ModuleRegistry::new();
        modules.register(module);

        let maps = MapRegistry::new();
        let policies = PolicyCatalog::new();
        let dict = Dictionary::core();
        let ctx = CompileCtx {
            modules: &modules,
            maps: &maps,
            policies: &policies,
            dict: &dict,
        };

        let ast = parse_section("authorize {\n  cache_store\n}\n").unwrap();
        let tree = ctx.compile(&ast, SectionKind::Authorize).unwrap();

        let mut server = VirtualServer::new("tls-cache");
        server.add_section(SectionKind::Authorize, None, tree);
        Arc::new(server)
    }

    fn cache(module: Arc<MemoryCacheModule>) -> SessionCache {
        SessionCache::new(
            SessionCacheConfig::default(),
            cache_server(module),
            Arc::new(AcceptAllChains),
        )
    }

    fn session() -> TlsSession {
        TlsSession::new(
            vec![0xaa; 16],
            b"serialized-session-state".to_vec(),
            Duration::from_secs(3600),
        )
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let module = MemoryCacheModule::new();
        let cache = cache(module);
        let session = session();

        let mut request = Request::new();
        cache.write(&mut request, &session).await;

        // The cache attributes are not observable after the call.
        assert!(!request.packet.contains(SESSION_ID_ATTR));
        assert!(!request.control.contains(CACHE_ACTION_ATTR));
        assert!(!request.session_state.contains(SESSION_DATA_ATTR));

        let restored = cache.read(&mut request, &session.id).await.unwrap();
        assert_eq!(restored, session);
        assert!(!request.session_state.contains(SESSION_DATA_ATTR));
    }

    #[tokio::test]
    async fn unknown_session_reads_as_none() {
        let module = MemoryCacheModule::new();
        let cache = cache(module);

        let mut request = Request::new();
        assert!(cache.read(&mut request, &[1, 2, 3]).await.is_none());
    }

    #[tokio::test]
    async fn delete_unknown_session_is_tolerated() {
        let module = MemoryCacheModule::new();
        let cache = cache(module);

        let mut request = Request::new();
        cache.delete(&mut request, &[9; 16]).await;
        assert!(!request.control.contains(CACHE_ACTION_ATTR));
    }

    #[tokio::test]
    async fn delete_removes_cached_session() {
        let module = MemoryCacheModule::new();
        let cache = cache(module.clone());
        let session = session();

        let mut request = Request::new();
        cache.write(&mut request, &session).await;
        cache.delete(&mut request, &session.id).await;

        assert!(cache.read(&mut request, &session.id).await.is_none());
    }

    struct RejectAllChains;

    impl ChainValidator for RejectAllChains {
        fn validate(&self, _request: &Request, _session: &TlsSession) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn failed_chain_validation_expires_session() {
        let module = MemoryCacheModule::new();
        let cache = SessionCache::new(
            SessionCacheConfig::default(),
            cache_server(module),
            Arc::new(RejectAllChains),
        );

        let session = session();
        let mut request = Request::new();
        cache.write(&mut request, &session).await;

        let restored = cache.read(&mut request, &session.id).await.unwrap();
        assert_eq!(restored.timeout, Duration::ZERO);
    }

    #[test]
    fn resumption_refusals() {
        let module = MemoryCacheModule::new();
        let mut config = SessionCacheConfig {
            require_extms: true,
            require_pfs: true,
            ..Default::default()
        };
        config.session_id_context = "eap-tls".to_string();

        let cache = SessionCache::new(config, cache_server(module), Arc::new(AcceptAllChains));
        assert_eq!(cache.session_id_context(), "eap-tls");

        let request = Request::new();
        let mut session = session();
        assert!(cache.allow_resumption(&request, &session));

        session.extms = false;
        assert!(!cache.allow_resumption(&request, &session));
        session.extms = true;

        session.forward_secure = false;
        assert!(!cache.allow_resumption(&request, &session));
        session.forward_secure = true;

        let mut request = Request::new();
        request
            .control
            .push(ALLOW_RESUMPTION_ATTR, Value::Bool(false));
        assert!(!cache.allow_resumption(&request, &session));
    }

    #[test]
    fn oversized_id_is_rejected() {
        let raw = TlsSession::new(vec![0; 300], vec![], Duration::ZERO);
        assert!(raw.id.len() > MAX_CACHE_ID_SIZE);

        // from_bytes rejects truncated input.
        assert!(matches!(
            TlsSession::from_bytes(&[0, 5, 1]),
            Err(CacheError::Truncated)
        ));
    }
}
