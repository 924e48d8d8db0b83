//! Service registry and request dispatch.
//!
//! A receiver type implements [`Service`] and lists its candidate methods in
//! a [`MethodSet`]. Every admitted method is stored as a type-erased invoker
//! that decodes the raw request payload into the method's request type, runs
//! the handler against a default response value and encodes the result.
//!
//! ```ignore
//! struct Arith;
//!
//! impl Service for Arith {
//!     fn methods<C: Codec>(set: &mut MethodSet<Self, C>) {
//!         set.method("Double", Arith::double);
//!     }
//! }
//!
//! registry.register(Arith).await?;
//! let reply = registry.dispatch("Arith.Double", Some(raw)).await;
//! ```

use std::any::type_name;
use std::collections::HashMap;
use std::fmt::Display;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::codec::Codec;
use super::protocol::{Message, RawPayload};
use crate::error::{Error, Result};

/// A receiver whose methods can be called remotely.
///
/// The service is addressed by its bare type name.
pub trait Service: Send + Sync + Sized + 'static {
    /// Offer candidate methods. Candidates whose name is not exported are
    /// skipped.
    fn methods<C: Codec>(set: &mut MethodSet<Self, C>);
}

/// Failure while dispatching one request. Sent back as the response `err`.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid method({0})")]
    InvalidMethod(String),

    #[error("service '{0}' not found")]
    ServiceNotFound(String),

    #[error("method '{method}' not found in service '{service}'")]
    MethodNotFound { service: String, method: String },

    #[error("failed to decode request: {0}")]
    Decode(String),

    #[error("failed to encode response: {0}")]
    Encode(String),

    /// Error returned by the handler itself, passed through verbatim.
    #[error("{0}")]
    Handler(String),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

type Invoke<S> = Arc<dyn Fn(&S, Option<RawPayload>) -> std::result::Result<RawPayload, DispatchError> + Send + Sync>;

type BoundInvoke = Arc<dyn Fn(Option<RawPayload>) -> std::result::Result<RawPayload, DispatchError> + Send + Sync>;

struct Candidate<S> {
    request_type: &'static str,
    response_type: &'static str,
    invoke: Invoke<S>,
}

/// Methods admitted for one service during registration.
pub struct MethodSet<S, C> {
    service: String,
    methods: HashMap<String, Candidate<S>>,
    _codec: PhantomData<fn() -> C>,
}

impl<S, C> MethodSet<S, C>
where
    S: Service,
    C: Codec,
{
    fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            methods: HashMap::new(),
            _codec: PhantomData,
        }
    }

    /// Offer `handler` under `name`.
    ///
    /// The handler receives the decoded request and a default-initialized
    /// response to fill in. An `Err` becomes the response error text. The
    /// method is admitted only if `name` is exported: an identifier starting
    /// with an uppercase ASCII letter.
    pub fn method<Req, Resp, E, F>(&mut self, name: &str, handler: F) -> &mut Self
    where
        F: Fn(&S, Req, &mut Resp) -> std::result::Result<(), E> + Send + Sync + 'static,
        Req: DeserializeOwned + 'static,
        Resp: Serialize + Default + 'static,
        E: Display,
    {
        if !is_exported(name) {
            debug!(service = %self.service, method = name, "Skipping unexported method");
            return self;
        }

        let invoke: Invoke<S> = Arc::new(move |receiver: &S, raw: Option<RawPayload>| {
            let request: Req =
                C::parse_raw(raw.as_ref()).map_err(|e| DispatchError::Decode(e.to_string()))?;
            let mut response = Resp::default();
            handler(receiver, request, &mut response).map_err(|e| {
                // An empty err field would read as success on the wire.
                let text = e.to_string();
                if text.is_empty() {
                    DispatchError::Handler("handler failed".to_string())
                } else {
                    DispatchError::Handler(text)
                }
            })?;
            C::encode_payload(&response).map_err(|e| DispatchError::Encode(e.to_string()))
        });

        self.methods.insert(
            name.to_string(),
            Candidate {
                request_type: type_name::<Req>(),
                response_type: type_name::<Resp>(),
                invoke,
            },
        );
        self
    }
}

/// Description of a registered method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub name: String,
    pub request_type: &'static str,
    pub response_type: &'static str,
}

struct BoundMethod {
    request_type: &'static str,
    response_type: &'static str,
    invoke: BoundInvoke,
}

/// Name to method table for every registered service.
pub struct Registry<C> {
    services: RwLock<HashMap<String, HashMap<String, BoundMethod>>>,
    _codec: PhantomData<fn() -> C>,
}

impl<C: Codec> Default for Registry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Codec> Registry<C> {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            _codec: PhantomData,
        }
    }

    /// Register `receiver` under its bare type name and return that name.
    ///
    /// Fails when the type has no usable name or when none of its candidate
    /// methods qualify. Registering the same name again replaces the entry.
    pub async fn register<S: Service>(&self, receiver: S) -> Result<String> {
        let name = service_name::<S>()
            .ok_or_else(|| Error::InvalidServiceName(type_name::<S>().to_string()))?;

        let mut set = MethodSet::<S, C>::new(&name);
        S::methods(&mut set);

        if set.methods.is_empty() {
            return Err(Error::NoExportedMethod(name));
        }

        let receiver = Arc::new(receiver);
        let methods: HashMap<String, BoundMethod> = set
            .methods
            .into_iter()
            .map(|(method, candidate)| {
                let receiver = Arc::clone(&receiver);
                let invoke = candidate.invoke;
                let bound = BoundMethod {
                    request_type: candidate.request_type,
                    response_type: candidate.response_type,
                    invoke: Arc::new(move |raw: Option<RawPayload>| invoke(receiver.as_ref(), raw)),
                };
                (method, bound)
            })
            .collect();

        let count = methods.len();
        let previous = self.services.write().await.insert(name.clone(), methods);
        if previous.is_some() {
            info!(service = %name, "Replaced previously registered service");
        }
        info!(service = %name, methods = count, "Registered service");

        Ok(name)
    }

    /// Names of all registered services, sorted.
    pub async fn services(&self) -> Vec<String> {
        let services = self.services.read().await;
        let mut names: Vec<String> = services.keys().cloned().collect();
        names.sort();
        names
    }

    /// Methods of `service`, sorted by name.
    pub async fn methods(&self, service: &str) -> Option<Vec<MethodInfo>> {
        let services = self.services.read().await;
        let methods = services.get(service)?;
        let mut infos: Vec<MethodInfo> = methods
            .iter()
            .map(|(name, method)| MethodInfo {
                name: name.clone(),
                request_type: method.request_type,
                response_type: method.response_type,
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Some(infos)
    }

    /// Run one request and build its response.
    ///
    /// Every failure is reported in the response `err`; this never fails.
    pub async fn dispatch(&self, method: &str, raw: Option<RawPayload>) -> Message {
        match self.invoke(method, raw).await {
            Ok(content) => {
                debug!(method = %method, "Dispatched request");
                Message::success(method, content)
            }
            Err(e) => {
                warn!(method = %method, error = %e, "Dispatch failed");
                Message::failure(method, e.to_string())
            }
        }
    }

    async fn invoke(
        &self,
        method: &str,
        raw: Option<RawPayload>,
    ) -> std::result::Result<RawPayload, DispatchError> {
        let (service_name, method_name) =
            split_method(method).ok_or_else(|| DispatchError::InvalidMethod(method.to_string()))?;

        let invoke = {
            let services = self.services.read().await;
            let service = services
                .get(service_name)
                .ok_or_else(|| DispatchError::ServiceNotFound(service_name.to_string()))?;
            let bound = service
                .get(method_name)
                .ok_or_else(|| DispatchError::MethodNotFound {
                    service: service_name.to_string(),
                    method: method_name.to_string(),
                })?;
            Arc::clone(&bound.invoke)
        };

        // Handlers are plain functions and may block.
        tokio::task::spawn_blocking(move || invoke(raw))
            .await
            .map_err(|e| DispatchError::Panicked(e.to_string()))?
    }
}

/// Split `Service.Method`. Exactly one `.` is allowed.
fn split_method(method: &str) -> Option<(&str, &str)> {
    let mut parts = method.split('.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(service), Some(method), None) => Some((service, method)),
        _ => None,
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_alphabetic() || first == '_' => {
            chars.all(|c| c.is_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

fn is_exported(name: &str) -> bool {
    is_identifier(name) && name.starts_with(|c: char| c.is_ascii_uppercase())
}

/// Bare type name of `S`: last path segment, generics stripped.
fn service_name<S>() -> Option<String> {
    let full = type_name::<S>();
    let path = full.split('<').next()?;
    let bare = path.rsplit("::").next()?;
    is_identifier(bare).then(|| bare.to_string())
}
