//! Reading a contiguous block of registers and classifying the outcome per address.

use crate::connection::{self, Connection};
use crate::modbus::{Operation, RegisterKind, Response, ResponseKind};
use crate::registers::RegisterValue;
use std::sync::Arc;
use tracing::debug;

#[derive(thiserror::Error, Debug)]
pub enum ReadError {
    #[error("could not send the read request")]
    Transport(#[source] connection::Error),
    #[error("no response arrived in time")]
    Timeout,
    #[error("the device responded with exception code {0}")]
    Exception(u8),
    #[error("the device responded with an empty payload")]
    EmptyPayload,
}

/// Something that can carry a Modbus request to the device and bring its response back.
///
/// A `None` response means the request timed out.
pub trait Transport: Send + Sync {
    fn send(
        &self,
        operation: Operation,
    ) -> impl Future<Output = Result<Option<Response>, connection::Error>> + Send;
}

impl Transport for Connection {
    async fn send(&self, operation: Operation) -> Result<Option<Response>, connection::Error> {
        Connection::send(self, operation).await
    }
}

pub struct RegisterLink<T> {
    transport: Arc<T>,
    kind: RegisterKind,
}

impl<T> Clone for RegisterLink<T> {
    fn clone(&self) -> Self {
        Self { transport: Arc::clone(&self.transport), kind: self.kind }
    }
}

impl<T: Transport> RegisterLink<T> {
    pub fn new(transport: Arc<T>, kind: RegisterKind) -> Self {
        Self { transport, kind }
    }

    /// Read `count` registers starting at `address`. Does not retry.
    ///
    /// On success the returned vector has exactly `count` entries. Registers the device left
    /// out of a short response are reported as [`RegisterValue::Unavailable`].
    pub async fn read(&self, address: u16, count: u16) -> Result<Vec<RegisterValue>, ReadError> {
        let operation = Operation::ReadRegisters { kind: self.kind, address, count };
        let response = self.transport.send(operation).await.map_err(ReadError::Transport)?;
        let Some(response) = response else {
            return Err(ReadError::Timeout);
        };
        if response.is_server_busy() {
            debug!(message = "the gateway is busy", address, count);
        }
        let values = match response.kind {
            ResponseKind::ErrorCode(code) => return Err(ReadError::Exception(code)),
            ResponseKind::Registers { values } => values,
        };
        let words = values.chunks_exact(2).map(|w| u16::from_be_bytes([w[0], w[1]]));
        let mut result = Vec::with_capacity(usize::from(count));
        result.extend(words.take(usize::from(count)).map(RegisterValue::Value));
        if result.is_empty() {
            return Err(ReadError::EmptyPayload);
        }
        if result.len() < usize::from(count) {
            debug!(
                message = "short response, padding with unavailable registers",
                address,
                requested = count,
                received = result.len()
            );
            result.resize(usize::from(count), RegisterValue::Unavailable);
        }
        Ok(result)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// What [`ScriptedTransport`] does with the next request.
    pub(crate) enum Reply {
        Answer(ResponseKind),
        /// The device never answers.
        Silence,
        /// The request cannot be delivered at all.
        Unreachable,
    }

    impl From<Option<ResponseKind>> for Reply {
        fn from(kind: Option<ResponseKind>) -> Self {
            kind.map_or(Reply::Silence, Reply::Answer)
        }
    }

    /// A transport that answers from a script and remembers what it was asked.
    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        pub(crate) script: Mutex<VecDeque<Reply>>,
        pub(crate) requests: Mutex<Vec<Operation>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(script: impl IntoIterator<Item = impl Into<Reply>>) -> Self {
            let script = script.into_iter().map(Into::into).collect();
            Self { script: Mutex::new(script), ..Default::default() }
        }
    }

    impl Transport for ScriptedTransport {
        async fn send(&self, operation: Operation) -> Result<Option<Response>, connection::Error> {
            self.requests.lock().unwrap().push(operation);
            let next = self.script.lock().unwrap().pop_front().unwrap_or(Reply::Silence);
            match next {
                Reply::Answer(kind) => Ok(Some(Response { device_id: 1, transaction_id: 0, kind })),
                Reply::Silence => Ok(None),
                Reply::Unreachable => {
                    Err(connection::Error::ConnectTimeout("127.0.0.1:502".to_string()))
                }
            }
        }
    }

    pub(crate) fn words(values: &[u16]) -> ResponseKind {
        ResponseKind::Registers { values: values.iter().flat_map(|v| v.to_be_bytes()).collect() }
    }

    #[tokio::test]
    async fn reads_block_in_order() {
        let transport = Arc::new(ScriptedTransport::new([Some(words(&[210, 0xFFF6, 7]))]));
        let link = RegisterLink::new(Arc::clone(&transport), RegisterKind::Input);
        let values = link.read(65, 3).await.unwrap();
        assert_eq!(
            values,
            [RegisterValue::Value(210), RegisterValue::Value(0xFFF6), RegisterValue::Value(7)]
        );
        assert_eq!(
            transport.requests.lock().unwrap()[..],
            [Operation::ReadRegisters { kind: RegisterKind::Input, address: 65, count: 3 }]
        );
    }

    #[tokio::test]
    async fn short_payload_pads_with_unavailable() {
        let transport = Arc::new(ScriptedTransport::new([Some(words(&[1, 2]))]));
        let link = RegisterLink::new(transport, RegisterKind::Holding);
        let values = link.read(10, 4).await.unwrap();
        assert_eq!(
            values,
            [
                RegisterValue::Value(1),
                RegisterValue::Value(2),
                RegisterValue::Unavailable,
                RegisterValue::Unavailable
            ]
        );
    }

    #[tokio::test]
    async fn failures_are_classified() {
        let transport = Arc::new(ScriptedTransport::new([
            Reply::Silence,
            Reply::Answer(ResponseKind::ErrorCode(2)),
            Reply::Answer(words(&[])),
            Reply::Unreachable,
        ]));
        let link = RegisterLink::new(transport, RegisterKind::Input);
        assert!(matches!(link.read(0, 1).await, Err(ReadError::Timeout)));
        assert!(matches!(link.read(0, 1).await, Err(ReadError::Exception(2))));
        assert!(matches!(link.read(0, 1).await, Err(ReadError::EmptyPayload)));
        assert!(matches!(
            link.read(0, 1).await,
            Err(ReadError::Transport(connection::Error::ConnectTimeout(_)))
        ));
    }
}
