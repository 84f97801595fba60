use std::collections::BTreeMap;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use log::debug;
use rhai::{Dynamic, Engine, EvalAltResult, FnPtr, ImmutableString, Map, INT};
use sha2::{Digest, Sha256};

use mh_core::{HostError, InvocationContext};

use crate::bridge::{throw, unwrap_script_error};
use crate::environment::InvocationSlot;

type HmacSha256 = Hmac<Sha256>;

/// A host-provided builtin module. `install` registers the backing native
/// functions on an environment's engine; `exports` produces the object handed
/// to scripts, bound fresh on every `require`.
pub trait Capability: Send + Sync {
    fn install(&self, engine: &mut Engine, slot: &InvocationSlot);
    fn exports(&self) -> Result<Map, HostError>;
}

/// Process-wide mapping from builtin module name to capability. Built once at
/// startup and passed by reference into every environment; never mutated
/// afterwards.
#[derive(Default)]
pub struct CapabilityRegistry {
    capabilities: BTreeMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock registry: crypto digests and a blocking HTTP client.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("host/crypto", Arc::new(CryptoCapability));
        registry.register("host/http", Arc::new(HttpCapability));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, capability: Arc<dyn Capability>) {
        self.capabilities.insert(name.into(), capability);
    }

    pub fn names(&self) -> Vec<&str> {
        self.capabilities.keys().map(String::as_str).collect()
    }

    pub(crate) fn exports_for(&self, name: &str) -> Result<Dynamic, HostError> {
        let capability = self
            .capabilities
            .get(name)
            .ok_or_else(|| HostError::UnknownModule(name.to_string()))?;
        Ok(Dynamic::from_map(capability.exports()?))
    }

    pub(crate) fn install_all(&self, engine: &mut Engine, slot: &InvocationSlot) {
        for capability in self.capabilities.values() {
            capability.install(engine, slot);
        }
    }
}

fn export_fn(map: &mut Map, key: &str, symbol: &str) -> Result<(), HostError> {
    let fn_ptr = FnPtr::new(symbol).map_err(|error| unwrap_script_error(*error))?;
    map.insert(key.into(), Dynamic::from(fn_ptr));
    Ok(())
}

/// `host/crypto`: hex-encoded SHA-256 and HMAC-SHA-256 digests.
pub struct CryptoCapability;

impl Capability for CryptoCapability {
    fn install(&self, engine: &mut Engine, slot: &InvocationSlot) {
        let active = slot.clone();
        engine.register_fn(
            "host_crypto_sha256",
            move |text: &str| -> Result<ImmutableString, Box<EvalAltResult>> {
                active.require_active("host/crypto").map_err(throw)?;
                Ok(hex::encode(Sha256::digest(text.as_bytes())).into())
            },
        );

        let active = slot.clone();
        engine.register_fn(
            "host_crypto_hmac_sha256",
            move |key: &str, text: &str| -> Result<ImmutableString, Box<EvalAltResult>> {
                active.require_active("host/crypto").map_err(throw)?;
                let mut mac = HmacSha256::new_from_slice(key.as_bytes())
                    .map_err(|error| throw(HostError::runtime(error.to_string())))?;
                mac.update(text.as_bytes());
                Ok(hex::encode(mac.finalize().into_bytes()).into())
            },
        );
    }

    fn exports(&self) -> Result<Map, HostError> {
        let mut map = Map::new();
        export_fn(&mut map, "sha256", "host_crypto_sha256")?;
        export_fn(&mut map, "hmac_sha256", "host_crypto_hmac_sha256")?;
        Ok(map)
    }
}

/// `host/http`: blocking GET/POST that honor the invocation deadline and the
/// per-call cookie jar.
pub struct HttpCapability;

impl HttpCapability {
    fn perform(
        ctx: &InvocationContext,
        mut request: ureq::Request,
        body: Option<&str>,
    ) -> Result<Map, Box<EvalAltResult>> {
        if ctx.should_interrupt() {
            return Err(throw(HostError::runtime(crate::INTERRUPT_SENTINEL)));
        }
        if let Some(remaining) = ctx.remaining() {
            request = request.timeout(remaining);
        }

        let cookies = ctx.cookies().entries();
        if !cookies.is_empty() {
            let header = cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; ");
            request = request.set("Cookie", &header);
        }

        let response = match body {
            Some(body) => request.send_string(body),
            None => request.call(),
        };
        let response = match response {
            Ok(response) => response,
            Err(ureq::Error::Status(status, response)) => {
                debug!("http status={status} url={}", response.get_url());
                response
            }
            Err(error) => return Err(throw(HostError::runtime(error.to_string()))),
        };

        if let Some(cookie) = response.header("set-cookie") {
            if let Some((name, value)) = cookie
                .split(';')
                .next()
                .and_then(|pair| pair.split_once('='))
            {
                ctx.cookies().set(name.trim(), value.trim());
            }
        }

        let status = response.status();
        let body = response
            .into_string()
            .map_err(|error| throw(HostError::runtime(error.to_string())))?;

        let mut map = Map::new();
        map.insert("status".into(), Dynamic::from_int(status as INT));
        map.insert("body".into(), Dynamic::from(body));
        Ok(map)
    }
}

impl Capability for HttpCapability {
    fn install(&self, engine: &mut Engine, slot: &InvocationSlot) {
        let active = slot.clone();
        engine.register_fn(
            "host_http_get",
            move |url: &str| -> Result<Map, Box<EvalAltResult>> {
                let ctx = active.require_active("host/http").map_err(throw)?;
                Self::perform(&ctx, ureq::get(url), None)
            },
        );

        let active = slot.clone();
        engine.register_fn(
            "host_http_post",
            move |url: &str, body: &str| -> Result<Map, Box<EvalAltResult>> {
                let ctx = active.require_active("host/http").map_err(throw)?;
                Self::perform(&ctx, ureq::post(url), Some(body))
            },
        );
    }

    fn exports(&self) -> Result<Map, HostError> {
        let mut map = Map::new();
        export_fn(&mut map, "get", "host_http_get")?;
        export_fn(&mut map, "post", "host_http_post")?;
        Ok(map)
    }
}
