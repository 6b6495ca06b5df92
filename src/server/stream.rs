use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};

// Needed to swap a plain TcpStream for a TLS stream mid-session, on either
// side of the proxy.
pub(crate) trait SideStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SideStream for T {}

pub(crate) type BoxedStream = Box<dyn SideStream>;
pub(crate) type StreamReadHalf = ReadHalf<BoxedStream>;
pub(crate) type StreamWriteHalf = WriteHalf<BoxedStream>;
