//! Command middleware: the seam through which an application steers the
//! proxy, most importantly by resolving a username to an origin address
//! during authentication.

use crate::server::controlchan::reply::Reply;
use crate::server::tls::TlsVersion;

use async_trait::async_trait;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

/// Error type middleware implementations may return. A middleware error
/// terminates the client connection with a `421`.
pub type MiddlewareError = Box<dyn std::error::Error + Send + Sync>;

/// The boxed future a plain-function middleware returns. See the blanket
/// [`Middleware`] impl for functions.
pub type MiddlewareFuture<'a> = Pin<Box<dyn Future<Output = Result<Option<Reply>, MiddlewareError>> + Send + 'a>>;

/// Per-connection view handed to middleware. Mutating the next origin
/// address steers the switch that follows a successful login.
#[derive(Debug)]
pub struct Context {
    remote_addr: SocketAddr,
    next_origin_addr: Option<String>,
    tls_protocol: Option<TlsVersion>,
}

impl Context {
    pub(crate) fn new(remote_addr: SocketAddr, next_origin_addr: Option<String>, tls_protocol: Option<TlsVersion>) -> Self {
        Context {
            remote_addr,
            next_origin_addr,
            tls_protocol,
        }
    }

    /// The client's remote address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// The TLS version negotiated with the client, if the control channel
    /// was upgraded.
    pub fn tls_protocol(&self) -> Option<TlsVersion> {
        self.tls_protocol
    }

    /// The origin the connection will be switched to after login.
    pub fn next_origin_addr(&self) -> Option<&str> {
        self.next_origin_addr.as_deref()
    }

    /// Route the upcoming switch to the given `host:port`.
    pub fn set_next_origin(&mut self, addr: impl Into<String>) {
        self.next_origin_addr = Some(addr.into());
    }

    /// Drop any routing decision; the currently bound origin stays in
    /// effect. The canonical `USER` middleware calls this when its lookup
    /// fails, so the default origin keeps serving the client.
    pub fn clear_next_origin(&mut self) {
        self.next_origin_addr = None;
    }
}

/// A hook invoked synchronously for one FTP verb, before the command is
/// forwarded to the origin. At most one middleware is registered per verb.
///
/// Returning `Ok(Some(reply))` short-circuits: the reply goes straight to
/// the client and the command is not forwarded.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Handles one occurrence of the registered verb. `arg` is the command
    /// argument with its original casing.
    async fn handle(&self, ctx: &mut Context, arg: &str) -> Result<Option<Reply>, MiddlewareError>;
}

// Allows plain functions to be middleware.
#[async_trait]
impl<Function> Middleware for Function
where
    Function: Send + Sync + for<'a> Fn(&'a mut Context, &'a str) -> MiddlewareFuture<'a>,
{
    async fn handle(&self, ctx: &mut Context, arg: &str) -> Result<Option<Reply>, MiddlewareError> {
        (self)(ctx, arg).await
    }
}
