pub mod response_sink;
pub mod upstream_transport;

pub use response_sink::{BufferedResponse, ResponseSink};
pub use upstream_transport::{TransportError, TransportResult, UpstreamTransport};
