//! `mqrpc` core: correlation ids, request/reply envelopes, and the response body.
//!
//! Transport-agnostic; the `mqrpc` crate moves these types over a broker.

pub mod codec;
pub mod correlation;
pub mod envelope;
pub mod operation;
pub mod response;

pub use correlation::CorrelationId;
pub use envelope::{
    EnvelopeError, MessageProperties, ReplyEnvelope, RequestEnvelope, WireMessage,
    OPERATION_HEADER,
};
pub use operation::{operation_names, NOTIFY_SUCCESS_MESSAGE};
pub use response::ResponseBody;

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
