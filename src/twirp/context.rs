use http::Extensions;

/// Package, service and method of a call.
///
/// Fields are filled in as the request progresses (the method is only known
/// once routing succeeds) and are never overwritten or blanked afterwards.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallIdentity {
    package: Option<String>,
    service: Option<String>,
    method: Option<String>,
}

impl CallIdentity {
    pub fn new(package: impl Into<String>, service: impl Into<String>) -> Self {
        let mut identity = Self::default();
        identity.set_package(package);
        identity.set_service(service);
        identity
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.set_method(method);
        self
    }

    pub fn package(&self) -> Option<&str> {
        self.package.as_deref()
    }

    pub fn service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    /// Returns `false` if the package was already known or `package` is empty.
    pub fn set_package(&mut self, package: impl Into<String>) -> bool {
        set_once(&mut self.package, package.into())
    }

    pub fn set_service(&mut self, service: impl Into<String>) -> bool {
        set_once(&mut self.service, service.into())
    }

    pub fn set_method(&mut self, method: impl Into<String>) -> bool {
        set_once(&mut self.method, method.into())
    }
}

fn set_once(slot: &mut Option<String>, value: String) -> bool {
    if slot.is_some() || value.is_empty() {
        return false;
    }
    *slot = Some(value);
    true
}

/// Request scoped state handed to every server hook.
///
/// `extensions` start out as the extensions of the inbound HTTP request, so
/// values placed there by outer middleware are visible to hooks, and hooks
/// can stash their own private types for later lifecycle stages.
#[derive(Clone, Debug, Default)]
pub struct RpcContext {
    identity: CallIdentity,
    status_code: Option<String>,
    extensions: Extensions,
}

impl RpcContext {
    pub fn new(identity: CallIdentity) -> Self {
        Self {
            identity,
            ..Self::default()
        }
    }

    pub fn with_extensions(mut self, extensions: Extensions) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn identity(&self) -> &CallIdentity {
        &self.identity
    }

    pub fn package_name(&self) -> Option<&str> {
        self.identity.package()
    }

    pub fn service_name(&self) -> Option<&str> {
        self.identity.service()
    }

    pub fn method_name(&self) -> Option<&str> {
        self.identity.method()
    }

    /// HTTP status of the response, available once the handler finished.
    pub fn status_code(&self) -> Option<&str> {
        self.status_code.as_deref()
    }

    pub fn set_method_name(&mut self, method: impl Into<String>) -> bool {
        self.identity.set_method(method)
    }

    pub fn set_status_code(&mut self, status: impl Into<String>) -> bool {
        set_once(&mut self.status_code, status.into())
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }
}
