//! Typed request → response procedures.
//!
//! A procedure is a handler that decodes one request type, computes a
//! response and sends it back on the caller's conversation. Registration is
//! explicit and happens at composition time:
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use serde::{Deserialize, Serialize};
//! # use peer_relay::core::packet::{PacketRegistry, PacketType};
//! # use peer_relay::protocol::dispatcher::Dispatcher;
//! # use peer_relay::protocol::procedure::{ProcedureMode, Procedures};
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Add(i64, i64);
//! impl PacketType for Add { const TAG: &'static str = "math.add"; }
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Sum(i64);
//! impl PacketType for Sum { const TAG: &'static str = "math.sum"; }
//!
//! let packets = PacketRegistry::builder().register::<Add>().register::<Sum>().build();
//! let dispatcher = Dispatcher::new(packets);
//! Procedures::new(&dispatcher)
//!     .register::<Add, Sum, _>(|_, Add(a, b)| Ok(Sum(a + b)), ProcedureMode::Inline)
//!     .unwrap();
//! ```
//!
//! [`ProcedureMode::Blocking`] procedures run on Tokio's blocking pool and
//! reply when they finish, so the connection task is never held up.
//! A failing procedure replies with an [`ErrorPacket`] of kind `Remote`.

use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{trace, warn};

use crate::core::packet::{Packet, PacketType};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::conversation::panic_message;
use crate::protocol::dispatcher::{Dispatcher, MessageContext, MessageHandler, ReplySender};
use crate::protocol::envelope::{ConversationId, Envelope, ErrorPacket};

/// Where a procedure body executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcedureMode {
    /// On the connection task; for cheap, non-blocking work
    #[default]
    Inline,
    /// On the blocking thread pool, replying asynchronously
    Blocking,
}

/// Who invoked a procedure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub peer: String,
    pub conversation_id: ConversationId,
}

/// Registration front-end over a [`Dispatcher`]
#[derive(Debug)]
pub struct Procedures<'a> {
    dispatcher: &'a Dispatcher,
}

impl<'a> Procedures<'a> {
    pub fn new(dispatcher: &'a Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Serve `Req` packets with `handler`, answering with `Resp`
    pub fn register<Req, Resp, F>(&self, handler: F, mode: ProcedureMode) -> Result<&Self>
    where
        Req: PacketType + Clone,
        Resp: PacketType,
        F: Fn(&Caller, Req) -> Result<Resp> + Send + Sync + 'static,
    {
        self.dispatcher.register(Arc::new(Procedure::<Req, Resp, F> {
            name: format!("procedure:{}", Req::TAG),
            handler: Arc::new(handler),
            mode,
            _types: PhantomData,
        }))?;
        Ok(self)
    }
}

struct Procedure<Req, Resp, F> {
    name: String,
    handler: Arc<F>,
    mode: ProcedureMode,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp, F> MessageHandler for Procedure<Req, Resp, F>
where
    Req: PacketType + Clone,
    Resp: PacketType,
    F: Fn(&Caller, Req) -> Result<Resp> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, packet: &dyn Packet) -> bool {
        packet.is::<Req>()
    }

    fn on_receive(&self, ctx: &MessageContext<'_>) -> Result<()> {
        let request = ctx
            .packet_as::<Req>()
            .cloned()
            .ok_or(ProtocolError::UnexpectedMessage)?;
        let caller = Caller {
            peer: ctx.source().to_string(),
            conversation_id: ctx.conversation_id(),
        };

        match self.mode {
            ProcedureMode::Inline => {
                let result = (self.handler)(&caller, request);
                let failure = result.as_ref().err().map(|e| e.to_string());
                reply(&ctx.sender(), ctx.envelope(), result)?;
                match failure {
                    Some(message) => Err(ProtocolError::HandlerFailure {
                        handler: self.name.clone(),
                        message,
                    }),
                    None => Ok(()),
                }
            }
            ProcedureMode::Blocking => {
                let runtime = Handle::try_current()
                    .map_err(|_| ProtocolError::Custom(constants::ERR_NO_RUNTIME.into()))?;
                let handler = Arc::clone(&self.handler);
                let link = ctx.sender();
                let inbound = ctx.envelope().clone();
                let name = self.name.clone();
                runtime.spawn_blocking(move || {
                    let result = catch_unwind(AssertUnwindSafe(|| handler(&caller, request)))
                        .unwrap_or_else(|panic| {
                            Err(ProtocolError::HandlerFailure {
                                handler: name.clone(),
                                message: panic_message(&panic),
                            })
                        });
                    if let Err(e) = &result {
                        warn!(procedure = %name, peer = %caller.peer, error = %e, "Procedure failed");
                    }
                    if let Err(e) = reply(&link, &inbound, result) {
                        warn!(procedure = %name, error = %e, "Failed to send procedure reply");
                    }
                });
                trace!(procedure = %self.name, "Procedure handed to blocking pool");
                Ok(())
            }
        }
    }
}

fn reply<Resp: PacketType>(
    link: &Arc<dyn ReplySender>,
    inbound: &Envelope,
    result: Result<Resp>,
) -> Result<()> {
    match result {
        Ok(response) => link.respond(inbound, &response),
        Err(e) => link.respond(inbound, &ErrorPacket::remote(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use crate::core::packet::PacketRegistry;
    use crate::protocol::dispatcher::testing::RecordingLink;
    use crate::protocol::envelope::{ErrorKind, TargetType};
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Divide(i64, i64);
    impl PacketType for Divide {
        const TAG: &'static str = "test.divide";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Quotient(i64);
    impl PacketType for Quotient {
        const TAG: &'static str = "test.quotient";
    }

    fn divide(_: &Caller, Divide(a, b): Divide) -> Result<Quotient> {
        if b == 0 {
            return Err(ProtocolError::Custom("division by zero".into()));
        }
        Ok(Quotient(a / b))
    }

    fn setup(mode: ProcedureMode) -> (Dispatcher, Arc<RecordingLink>) {
        let dispatcher = Dispatcher::new(
            PacketRegistry::builder()
                .register::<Divide>()
                .register::<Quotient>()
                .build(),
        );
        Procedures::new(&dispatcher)
            .register::<Divide, Quotient, _>(divide, mode)
            .unwrap();
        (dispatcher, RecordingLink::new("calc"))
    }

    fn call(dispatcher: &Dispatcher, link: &Arc<RecordingLink>, request: Divide) {
        let envelope =
            Envelope::new("alice", "calc", TargetType::Direct, ConversationId(11), &request)
                .unwrap();
        let link: Arc<dyn ReplySender> = link.clone();
        dispatcher.dispatch(&envelope, &link);
    }

    #[test]
    fn test_inline_procedure_replies_on_same_conversation() {
        let (dispatcher, link) = setup(ProcedureMode::Inline);
        call(&dispatcher, &link, Divide(10, 2));

        let sent = link.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].target, "alice");
        assert_eq!(sent[0].conversation_id, ConversationId(11));
        let reply = dispatcher
            .packets()
            .deserialize_as::<Quotient>(&sent[0].payload)
            .unwrap();
        assert_eq!(reply, Quotient(5));
    }

    #[test]
    fn test_inline_failure_replies_remote_error_and_reports() {
        let (dispatcher, link) = setup(ProcedureMode::Inline);
        let failures = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&failures);
        dispatcher
            .set_error_hook(move |f| sink.lock().push(f.handler.clone()))
            .unwrap();

        call(&dispatcher, &link, Divide(1, 0));

        let sent = link.sent.lock();
        let error = dispatcher
            .packets()
            .deserialize_as::<ErrorPacket>(&sent[0].payload)
            .unwrap();
        assert_eq!(error.kind, ErrorKind::Remote);
        assert!(error.message.contains("division by zero"));
        assert_eq!(*failures.lock(), vec!["procedure:test.divide".to_string()]);
    }

    #[tokio::test]
    async fn test_blocking_procedure_replies_later() {
        let (dispatcher, link) = setup(ProcedureMode::Blocking);
        call(&dispatcher, &link, Divide(9, 3));

        let mut replies = 0;
        for _ in 0..50 {
            replies = link.sent.lock().len();
            if replies > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(replies, 1);
        let sent = link.sent.lock();
        let reply = dispatcher
            .packets()
            .deserialize_as::<Quotient>(&sent[0].payload)
            .unwrap();
        assert_eq!(reply, Quotient(3));
    }

    #[test]
    fn test_blocking_without_runtime_is_reported() {
        let (dispatcher, link) = setup(ProcedureMode::Blocking);
        let failures = Arc::new(parking_lot::Mutex::new(0));
        let sink = Arc::clone(&failures);
        dispatcher.set_error_hook(move |_| *sink.lock() += 1).unwrap();

        call(&dispatcher, &link, Divide(9, 3));
        assert_eq!(*failures.lock(), 1);
        assert!(link.sent.lock().is_empty());
    }
}
