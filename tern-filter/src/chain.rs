use std::sync::Arc;

use tern_common::{Address, Mail, Reply, internal};
use tern_tracing::traced;

use crate::{
    context::{MessageContext, RecipientContext, SessionInfo},
    pipeline::{Pipeline, Stage},
    verdict::{MessageVerdict, RecipientVerdict, Verdict},
};

/// The recipient and message filters configured for incoming mail.
#[derive(Clone, Debug, Default)]
pub struct FilterChain {
    recipient: Pipeline<RecipientContext, RecipientVerdict>,
    message: Pipeline<MessageContext, MessageVerdict>,
}

impl FilterChain {
    pub fn builder() -> FilterChainBuilder {
        FilterChainBuilder::default()
    }

    /// Run the recipient filters for one `RCPT TO`.
    ///
    /// When no filter decides, a recipient with a resolved destination is
    /// accepted with it, and any other recipient is unknown.
    #[traced(instrument(level = tracing::Level::DEBUG, skip_all, fields(recipient = %recipient)), timing(precision = "us"))]
    pub async fn evaluate_recipient(
        &self,
        session: Arc<SessionInfo>,
        recipient: Address,
    ) -> RecipientVerdict {
        let mut context = RecipientContext::new(session, recipient);

        let verdict = match self.recipient.run(&mut context).await {
            Some(verdict) => verdict,
            None => context.destination.map_or_else(
                || Verdict::Reject(Reply::unknown_recipient()),
                Verdict::Accept,
            ),
        };

        internal!(level = DEBUG, recipient = %context.recipient, ?verdict, "Recipient evaluated");
        verdict
    }

    /// Run the message filters once the content has been received.
    #[traced(instrument(level = tracing::Level::DEBUG, skip_all, fields(mail = %mail.id)), timing(precision = "us"))]
    pub async fn evaluate_message(&self, session: Arc<SessionInfo>, mail: &Mail) -> MessageVerdict {
        let mut context = MessageContext {
            session,
            mail: mail.clone(),
        };

        let verdict = self
            .message
            .run(&mut context)
            .await
            .unwrap_or(Verdict::Accept(()));

        internal!(level = DEBUG, mail = %mail.id, ?verdict, "Message evaluated");
        verdict
    }

    pub fn recipient_filters(&self) -> impl Iterator<Item = &str> {
        self.recipient.names()
    }

    pub fn message_filters(&self) -> impl Iterator<Item = &str> {
        self.message.names()
    }
}

#[derive(Default)]
pub struct FilterChainBuilder {
    recipient: Pipeline<RecipientContext, RecipientVerdict>,
    message: Pipeline<MessageContext, MessageVerdict>,
}

impl FilterChainBuilder {
    #[must_use]
    pub fn recipient_filter(
        mut self,
        filter: impl Stage<RecipientContext, RecipientVerdict> + 'static,
    ) -> Self {
        self.recipient.push(Arc::new(filter));
        self
    }

    #[must_use]
    pub fn message_filter(
        mut self,
        filter: impl Stage<MessageContext, MessageVerdict> + 'static,
    ) -> Self {
        self.message.push(Arc::new(filter));
        self
    }

    pub fn push_recipient_filter(
        &mut self,
        filter: Arc<dyn Stage<RecipientContext, RecipientVerdict>>,
    ) {
        self.recipient.push(filter);
    }

    pub fn push_message_filter(&mut self, filter: Arc<dyn Stage<MessageContext, MessageVerdict>>) {
        self.message.push(filter);
    }

    pub fn build(self) -> FilterChain {
        FilterChain {
            recipient: self.recipient,
            message: self.message,
        }
    }
}
