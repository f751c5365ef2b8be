use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::ContentType;
use crate::error::{Result, RpcError};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A method with its argument/reply types erased. The handler decodes the
/// request payload with the connection's codec, runs the typed closure,
/// and re-encodes the reply with the same codec. Errors come back as the
/// text that goes into the response header.
type ErasedHandler =
    Box<dyn Fn(ContentType, Vec<u8>) -> BoxFuture<std::result::Result<Vec<u8>, String>> + Send + Sync>;

pub struct Method {
    name: String,
    handler: ErasedHandler,
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Method {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn invoke(
        &self,
        content: ContentType,
        payload: Vec<u8>,
    ) -> BoxFuture<std::result::Result<Vec<u8>, String>> {
        (self.handler)(content, payload)
    }
}

/// A named collection of invocable methods.
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<Method>>,
}

impl Service {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn builder(name: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder::new(name)
    }
}

/// Builds a [`Service`] by registering each method explicitly with a typed
/// async closure. There is no runtime reflection here; the closure carries
/// the argument and reply types, and erasure happens at registration.
pub struct ServiceBuilder {
    name: String,
    methods: HashMap<String, Arc<Method>>,
}

impl ServiceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        ServiceBuilder {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    /// Register a method. The handler takes the decoded argument value and
    /// resolves to the reply; any handler error is stringified into the
    /// response header.
    pub fn method<A, R, E, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: fmt::Display,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        let erased: ErasedHandler = Box::new(move |content, payload| {
            let invoked: BoxFuture<std::result::Result<Vec<u8>, String>> =
                match content.unmarshal::<A>(&payload) {
                    Ok(args) => {
                        let reply = handler(args);
                        Box::pin(async move {
                            let reply = reply.await.map_err(|err| err.to_string())?;
                            content.marshal(&reply).map_err(|err| err.to_string())
                        })
                    }
                    Err(err) => {
                        let message = err.to_string();
                        Box::pin(async move { Err(message) })
                    }
                };
            invoked
        });
        self.methods.insert(
            name.to_string(),
            Arc::new(Method {
                name: name.to_string(),
                handler: erased,
            }),
        );
        self
    }

    pub fn build(self) -> Service {
        Service {
            name: self.name,
            methods: self.methods,
        }
    }
}

/// Server-side service map: concurrent lookups while serving, exclusive
/// registration, duplicate names rejected.
pub(crate) struct ServiceMap {
    services: RwLock<HashMap<String, Arc<Service>>>,
}

impl ServiceMap {
    pub fn new() -> Self {
        ServiceMap {
            services: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, service: Service) -> Result<()> {
        let mut services = self.services.write().unwrap();
        if services.contains_key(service.name()) {
            return Err(RpcError::ServiceAlreadyDefined(service.name().to_string()));
        }
        services.insert(service.name().to_string(), Arc::new(service));
        Ok(())
    }

    /// Resolve `"<Service>.<Method>"`, splitting on the last dot.
    pub fn find(&self, service_method: &str) -> Result<Arc<Method>> {
        let dot = service_method
            .rfind('.')
            .ok_or_else(|| RpcError::MalformedMethod(service_method.to_string()))?;
        let (service_name, method_name) = (&service_method[..dot], &service_method[dot + 1..]);

        let services = self.services.read().unwrap();
        let service = services
            .get(service_name)
            .ok_or_else(|| RpcError::UnknownService(service_name.to_string()))?;
        service
            .methods
            .get(method_name)
            .cloned()
            .ok_or_else(|| RpcError::UnknownMethod(method_name.to_string()))
    }
}

impl Default for ServiceMap {
    fn default() -> Self {
        ServiceMap::new()
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Serialize, Deserialize)]
    struct Args {
        num1: i64,
        num2: i64,
    }

    fn arith() -> Service {
        Service::builder("Arith")
            .method("Add", |args: Args| async move {
                Ok::<_, String>(args.num1 + args.num2)
            })
            .build()
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let map = ServiceMap::new();
        map.register(arith()).unwrap();
        let err = map.register(arith()).unwrap_err();
        assert_eq!(err.to_string(), "service already defined: Arith");
    }

    #[test]
    fn lookup_errors() {
        let map = ServiceMap::new();
        map.register(arith()).unwrap();

        let err = map.find("Arith").unwrap_err();
        assert!(matches!(err, RpcError::MalformedMethod(_)));

        let err = map.find("Nope.Add").unwrap_err();
        assert_eq!(err.to_string(), "can't find service: Nope");

        let err = map.find("Arith.Sub").unwrap_err();
        assert_eq!(err.to_string(), "can't find method: Sub");
    }

    #[tokio::test]
    async fn invoke_decodes_args_and_encodes_reply() {
        let map = ServiceMap::new();
        map.register(arith()).unwrap();
        let method = map.find("Arith.Add").unwrap();

        let content = ContentType::Bincode;
        let payload = content.marshal(&Args { num1: 2, num2: 3 }).unwrap();
        let reply = method.invoke(content, payload).await.unwrap();
        assert_eq!(content.unmarshal::<i64>(&reply).unwrap(), 5);
    }

    #[tokio::test]
    async fn handler_errors_become_header_text() {
        let service = Service::builder("Arith")
            .method("Fail", |_args: Args| async move {
                Err::<i64, _>("division by zero")
            })
            .build();
        let map = ServiceMap::new();
        map.register(service).unwrap();
        let method = map.find("Arith.Fail").unwrap();

        let content = ContentType::Bincode;
        let payload = content.marshal(&Args { num1: 1, num2: 0 }).unwrap();
        let err = method.invoke(content, payload).await.unwrap_err();
        assert_eq!(err, "division by zero");
    }

    #[tokio::test]
    async fn undecodable_args_become_header_text() {
        let map = ServiceMap::new();
        map.register(arith()).unwrap();
        let method = map.find("Arith.Add").unwrap();

        let err = method
            .invoke(ContentType::Json, b"{not json".to_vec())
            .await
            .unwrap_err();
        assert!(!err.is_empty());
    }
}
