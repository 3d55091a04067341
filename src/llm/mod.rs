pub mod gateway;
pub mod parse;

pub use gateway::{
    ChatGateway, ChatMessage, CompletionOptions, ContentPart, GatewayConfig, GatewayError,
    MessageContent, ModelGateway, RawModelResponse, ResponseFormat,
};
