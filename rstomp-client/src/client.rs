//! High-level client API.

use crate::connection::{Connection, ConnectionConfig, SessionInfo};
use crate::error::ClientError;
use bytes::Bytes;
use rstomp_protocol::headers::header;
use rstomp_protocol::{Command, Frame, JsonSerializer, MessageSerializer};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How the broker waits for acknowledgements on a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Messages count as delivered once sent.
    #[default]
    Auto,
    /// ACK covers the message and everything delivered before it.
    Client,
    /// ACK covers only the named message.
    ClientIndividual,
}

impl AckMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::ClientIndividual => "client-individual",
        }
    }
}

/// A MESSAGE received on a subscription.
#[derive(Debug, Clone)]
pub struct Message {
    frame: Frame,
}

impl Message {
    pub fn destination(&self) -> Option<&str> {
        self.frame.header(header::DESTINATION)
    }

    pub fn subscription(&self) -> Option<&str> {
        self.frame.header(header::SUBSCRIPTION)
    }

    pub fn message_id(&self) -> Option<&str> {
        self.frame.header(header::MESSAGE_ID)
    }

    /// Id to quote when acknowledging: the `ack` header when present.
    pub fn ack_id(&self) -> Option<&str> {
        self.frame
            .header(header::ACK)
            .or_else(|| self.message_id())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.frame.header(name)
    }

    pub fn body(&self) -> &[u8] {
        self.frame.body.as_deref().unwrap_or_default()
    }

    pub fn body_str(&self) -> Option<&str> {
        self.frame.body_str()
    }

    /// Decodes a JSON body.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        Ok(JsonSerializer.read_body(&self.frame)?)
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }
}

/// An active subscription. Messages arrive in delivery order.
#[derive(Debug)]
pub struct Subscription {
    id: String,
    destination: String,
    ack: AckMode,
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack
    }

    /// Waits for the next message. Returns `None` once the connection is gone.
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await.map(|frame| Message { frame })
    }

    /// Returns a message if one is already waiting.
    pub fn try_next(&mut self) -> Option<Message> {
        self.rx.try_recv().ok().map(|frame| Message { frame })
    }
}

/// An open transaction. Finish it with [`Client::commit`] or [`Client::abort`].
#[derive(Debug)]
pub struct Transaction {
    id: String,
}

impl Transaction {
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// High-level STOMP client.
///
/// Every command except heart-beats is sent with a receipt request, so each
/// call returns once the broker has processed it.
pub struct Client {
    conn: Arc<Connection>,
    info: SessionInfo,
    reader: JoinHandle<()>,
    heartbeat: Option<JoinHandle<()>>,
}

impl Client {
    /// Connects, completes CONNECT and starts the background reader.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ClientError> {
        let conn = Arc::new(Connection::new(config));
        let info = conn.connect().await?;

        let reader = {
            let conn = conn.clone();
            tokio::spawn(async move {
                if let Err(e) = conn.read_loop().await {
                    tracing::debug!("Read loop ended: {}", e);
                }
            })
        };

        let heartbeat = (info.heart_beat.0 > 0).then(|| {
            let conn = conn.clone();
            let interval = Duration::from_millis(info.heart_beat.0);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if conn.heartbeat().await.is_err() {
                        break;
                    }
                }
            })
        });

        Ok(Self {
            conn,
            info,
            reader,
            heartbeat,
        })
    }

    /// Returns what the broker reported in CONNECTED.
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    // =========================================================================
    // Producing
    // =========================================================================

    /// Sends a message to a destination.
    pub async fn send(&self, destination: &str, body: impl Into<Bytes>) -> Result<(), ClientError> {
        self.send_frame(send_frame(destination, None).with_body(body))
            .await
    }

    /// Sends `value` as a JSON body.
    pub async fn send_json<T: Serialize + ?Sized>(
        &self,
        destination: &str,
        value: &T,
    ) -> Result<(), ClientError> {
        let mut frame = send_frame(destination, None);
        JsonSerializer.write_body(&mut frame, value)?;
        self.send_frame(frame).await
    }

    /// Sends a message that is delivered only when `transaction` commits.
    pub async fn send_in(
        &self,
        transaction: &Transaction,
        destination: &str,
        body: impl Into<Bytes>,
    ) -> Result<(), ClientError> {
        self.send_frame(send_frame(destination, Some(transaction)).with_body(body))
            .await
    }

    /// Sends an arbitrary frame and waits for its receipt.
    pub async fn send_frame(&self, frame: Frame) -> Result<(), ClientError> {
        self.conn.request(frame).await?;
        Ok(())
    }

    // =========================================================================
    // Consuming
    // =========================================================================

    /// Subscribes to a destination.
    pub async fn subscribe(
        &self,
        destination: &str,
        ack: AckMode,
    ) -> Result<Subscription, ClientError> {
        let id = self.conn.next_id("sub");
        // route before subscribing so no early MESSAGE is dropped
        let rx = self.conn.register_subscription(&id).await;

        let frame = Frame::from_command(Command::Subscribe)
            .with_header(header::ID, id.as_str())
            .with_header(header::DESTINATION, destination)
            .with_header(header::ACK, ack.as_str());
        if let Err(e) = self.conn.request(frame).await {
            self.conn.unregister_subscription(&id).await;
            return Err(e);
        }

        Ok(Subscription {
            id,
            destination: destination.to_string(),
            ack,
            rx,
        })
    }

    /// Ends a subscription. Unacknowledged messages go back to the queue.
    pub async fn unsubscribe(&self, subscription: Subscription) -> Result<(), ClientError> {
        let frame =
            Frame::from_command(Command::Unsubscribe).with_header(header::ID, subscription.id());
        let result = self.conn.request(frame).await;
        self.conn.unregister_subscription(subscription.id()).await;
        result.map(|_| ())
    }

    pub async fn ack(&self, message: &Message) -> Result<(), ClientError> {
        self.acknowledge(Command::Ack, message, None).await
    }

    /// Rejects a message; the broker delivers it again.
    pub async fn nack(&self, message: &Message) -> Result<(), ClientError> {
        self.acknowledge(Command::Nack, message, None).await
    }

    pub async fn ack_in(
        &self,
        transaction: &Transaction,
        message: &Message,
    ) -> Result<(), ClientError> {
        self.acknowledge(Command::Ack, message, Some(transaction))
            .await
    }

    pub async fn nack_in(
        &self,
        transaction: &Transaction,
        message: &Message,
    ) -> Result<(), ClientError> {
        self.acknowledge(Command::Nack, message, Some(transaction))
            .await
    }

    async fn acknowledge(
        &self,
        command: Command,
        message: &Message,
        transaction: Option<&Transaction>,
    ) -> Result<(), ClientError> {
        let mut frame = Frame::from_command(command);
        if self.info.version == "1.2" {
            let id = message
                .ack_id()
                .ok_or_else(|| ClientError::UnexpectedFrame("MESSAGE without ack id".into()))?;
            frame = frame.with_header(header::ID, id);
        } else {
            let id = message
                .message_id()
                .ok_or_else(|| ClientError::UnexpectedFrame("MESSAGE without message-id".into()))?;
            frame = frame
                .with_header(header::MESSAGE_ID, id)
                .with_header(header::SUBSCRIPTION, message.subscription().unwrap_or_default());
        }
        if let Some(transaction) = transaction {
            frame = frame.with_header(header::TRANSACTION, transaction.id());
        }
        self.send_frame(frame).await
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Starts a transaction.
    pub async fn begin(&self) -> Result<Transaction, ClientError> {
        let id = self.conn.next_id("tx");
        let frame = Frame::from_command(Command::Begin).with_header(header::TRANSACTION, id.as_str());
        self.send_frame(frame).await?;
        Ok(Transaction { id })
    }

    /// Applies everything sent or acknowledged in the transaction.
    pub async fn commit(&self, transaction: Transaction) -> Result<(), ClientError> {
        let frame =
            Frame::from_command(Command::Commit).with_header(header::TRANSACTION, transaction.id);
        self.send_frame(frame).await
    }

    /// Discards everything sent or acknowledged in the transaction.
    pub async fn abort(&self, transaction: Transaction) -> Result<(), ClientError> {
        let frame =
            Frame::from_command(Command::Abort).with_header(header::TRANSACTION, transaction.id);
        self.send_frame(frame).await
    }

    /// Sends DISCONNECT, waits for the receipt and closes the connection.
    pub async fn disconnect(self) -> Result<(), ClientError> {
        let result = self
            .conn
            .request(Frame::from_command(Command::Disconnect))
            .await;
        self.conn.close().await?;
        result.map(|_| ())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
        if let Some(ref heartbeat) = self.heartbeat {
            heartbeat.abort();
        }
    }
}

fn send_frame(destination: &str, transaction: Option<&Transaction>) -> Frame {
    let frame = Frame::from_command(Command::Send).with_header(header::DESTINATION, destination);
    match transaction {
        Some(transaction) => frame.with_header(header::TRANSACTION, transaction.id()),
        None => frame,
    }
}
