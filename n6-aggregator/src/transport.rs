//! Message transports feeding the aggregator.

use std::io;

use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines, Stdin, Stdout,
};

use crate::error::ProcessingError;

/// An error of the message transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Receiving the next message failed.
    #[error("failed to receive a message")]
    Receive(#[source] io::Error),

    /// Publishing a message failed.
    #[error("failed to publish a message with routing key {routing_key}")]
    Publish {
        /// Routing key of the message.
        routing_key: String,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Publishing was stopped before.
    #[error("publishing has been stopped")]
    Closed,
}

/// A message received from the transport.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
    /// Sequence number assigned by the transport.
    pub delivery_tag: u64,
    /// The raw message body.
    pub body: Vec<u8>,
}

/// Source of input messages and sink of published events.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Waits for the next message.
    ///
    /// Returns `Ok(None)` once the input is exhausted or consuming was stopped. The returned
    /// future must be cancel safe.
    async fn next_message(&mut self) -> Result<Option<Message>, TransportError>;

    /// Publishes a message body under the given routing key.
    async fn publish(&mut self, routing_key: &str, body: Vec<u8>) -> Result<(), TransportError>;

    /// Confirms that a message was processed.
    fn acknowledge(&mut self, _message: &Message) {}

    /// Rejects a message that could not be processed.
    fn reject(&mut self, message: &Message, error: &ProcessingError);

    /// Stops receiving messages.
    fn stop_consuming(&mut self);

    /// Stops publishing messages.
    fn stop_publishing(&mut self);
}

/// Line-delimited transport.
///
/// Every input line holds one JSON message. Published events are written as lines of the form
/// `<routing key>\t<json body>`.
#[derive(Debug)]
pub struct LineTransport<R, W> {
    lines: Lines<R>,
    output: W,
    next_tag: u64,
    consuming: bool,
    publishing: bool,
}

/// [`LineTransport`] on standard input and output.
pub type StdioTransport = LineTransport<BufReader<Stdin>, Stdout>;

impl StdioTransport {
    /// Creates a transport reading stdin and writing stdout.
    pub fn stdio() -> Self {
        LineTransport::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl<R, W> LineTransport<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Creates a transport on the given reader and writer.
    pub fn new(input: R, output: W) -> Self {
        Self {
            lines: input.lines(),
            output,
            next_tag: 1,
            consuming: true,
            publishing: true,
        }
    }

    /// Returns the output writer.
    pub fn into_output(self) -> W {
        self.output
    }
}

impl<R, W> Transport for LineTransport<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn next_message(&mut self) -> Result<Option<Message>, TransportError> {
        while self.consuming {
            let Some(line) = self
                .lines
                .next_line()
                .await
                .map_err(TransportError::Receive)?
            else {
                return Ok(None);
            };

            if line.trim().is_empty() {
                continue;
            }

            let delivery_tag = self.next_tag;
            self.next_tag += 1;
            return Ok(Some(Message {
                delivery_tag,
                body: line.into_bytes(),
            }));
        }

        Ok(None)
    }

    async fn publish(&mut self, routing_key: &str, body: Vec<u8>) -> Result<(), TransportError> {
        if !self.publishing {
            return Err(TransportError::Closed);
        }

        let mut line = Vec::with_capacity(routing_key.len() + body.len() + 2);
        line.extend_from_slice(routing_key.as_bytes());
        line.push(b'\t');
        line.extend_from_slice(&body);
        line.push(b'\n');

        let result = async {
            self.output.write_all(&line).await?;
            self.output.flush().await
        };

        result.await.map_err(|source| TransportError::Publish {
            routing_key: routing_key.to_owned(),
            source,
        })
    }

    fn reject(&mut self, message: &Message, error: &ProcessingError) {
        n6_log::warn!(
            delivery_tag = message.delivery_tag,
            error = error as &dyn std::error::Error,
            "rejected message",
        );
    }

    fn stop_consuming(&mut self) {
        self.consuming = false;
    }

    fn stop_publishing(&mut self) {
        self.publishing = false;
    }
}
