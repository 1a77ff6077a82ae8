//! Cliente da API Anthropic usado como serviço de geração de histórias.
//!
//! O trait [`MessageSender`] é a costura entre o pipeline e o serviço externo:
//! o [`AnthropicClient`] real o implementa via HTTP e os testes usam mocks.

pub mod client;
pub mod error;
pub mod types;

pub use client::AnthropicClient;
pub use error::AnthropicError;
pub use types::{ContentBlock, Message, MessagesRequest, MessagesResponse, Usage};

/// Anything that can answer a Messages API request.
#[allow(async_fn_in_trait)]
pub trait MessageSender {
    async fn send_message(&self, req: &MessagesRequest)
    -> Result<MessagesResponse, AnthropicError>;
}

impl MessageSender for AnthropicClient {
    async fn send_message(
        &self,
        req: &MessagesRequest,
    ) -> Result<MessagesResponse, AnthropicError> {
        AnthropicClient::send_message(self, req).await
    }
}
