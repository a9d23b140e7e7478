mod body;
mod head;
mod helper;
mod hostmatch;
mod stream;

pub use body::{copy_chunked, read_to_buffer_or_stream, BodyBuffer, BodyReader, ReplayReader};
pub use head::{
    parse_request_head, parse_response_head, BodyMode, Header, Headers, HttpVersion, RequestHead,
    ResponseHead,
};
pub use helper::{
    canonical_addr, default_scheme_port, host_with_default_port, is_normal_close_error,
    is_tls_client_hello, NORMAL_CLOSE_ERRORS,
};
pub use hostmatch::HostMatcher;
pub use stream::{PeekableStream, IO_CHUNK_SIZE};

/// Upper bound for a request or response head, CONNECT heads included.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;
