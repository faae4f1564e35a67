//! Gemini streaming text generation

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{ChatPart, ChatTurn, TextGenerator, TextStream};
use crate::gemini::{
    Content, GeminiClient, GenerateContentRequest, GenerateContentResponse, InlineData, Part,
};
use crate::transcript::Role;
use crate::voice::encode_transport;
use crate::{Error, Result};

/// Fragments buffered between the HTTP reader and the consumer
const FRAGMENT_BUFFER: usize = 32;

/// Text generation over `streamGenerateContent` server-sent events
pub struct GeminiChat {
    client: GeminiClient,
    model: String,
    system_prompt: Option<String>,
}

impl GeminiChat {
    #[must_use]
    pub const fn new(client: GeminiClient, model: String, system_prompt: Option<String>) -> Self {
        Self {
            client,
            model,
            system_prompt,
        }
    }

    fn request(&self, history: &[ChatTurn], parts: &[ChatPart]) -> GenerateContentRequest {
        let mut contents: Vec<Content> = history
            .iter()
            .map(|turn| to_content(turn.role, &turn.parts))
            .collect();
        contents.push(to_content(Role::User, parts));

        GenerateContentRequest {
            contents,
            system_instruction: self
                .system_prompt
                .as_deref()
                .filter(|p| !p.trim().is_empty())
                .map(|p| Content::text(None, p)),
            generation_config: None,
        }
    }
}

fn to_content(role: Role, parts: &[ChatPart]) -> Content {
    let role = match role {
        Role::User => "user",
        Role::Model => "model",
    };
    Content {
        role: Some(role.to_string()),
        parts: parts
            .iter()
            .map(|part| match part {
                ChatPart::Text(text) => Part::text(text.as_str()),
                ChatPart::InlineImage { mime_type, data } => Part {
                    text: None,
                    inline_data: Some(InlineData {
                        mime_type: mime_type.clone(),
                        data: encode_transport(data),
                    }),
                },
            })
            .collect(),
    }
}

/// Text carried by one SSE line; `None` for anything that is not a data line
fn parse_sse_line(line: &str) -> Option<Result<String>> {
    let data = line.trim().strip_prefix("data:")?.trim_start();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    match serde_json::from_str::<GenerateContentResponse>(data) {
        Ok(response) => {
            let text = response.text();
            (!text.is_empty()).then_some(Ok(text))
        }
        Err(e) => Some(Err(e.into())),
    }
}

#[async_trait]
impl TextGenerator for GeminiChat {
    async fn stream(&self, history: &[ChatTurn], parts: Vec<ChatPart>) -> Result<TextStream> {
        let request = self.request(history, &parts);

        let response = self
            .client
            .post(&self.model, "streamGenerateContent")
            .query(&[("alt", "sse")])
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Generation(format!("Gemini API error {status}: {body}")));
        }

        let (tx, rx) = mpsc::channel(FRAGMENT_BUFFER);
        let model = self.model.clone();

        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            // Raw bytes; a multi-byte character may straddle two chunks
            let mut buffer: Vec<u8> = Vec::new();

            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(e.into())).await;
                        return;
                    }
                };
                buffer.extend_from_slice(&chunk);

                while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=newline).collect();
                    let line = String::from_utf8_lossy(&line);
                    if let Some(fragment) = parse_sse_line(&line)
                        && tx.send(fragment).await.is_err()
                    {
                        tracing::debug!(%model, "chat stream dropped by consumer");
                        return;
                    }
                }
            }

            if let Some(fragment) = parse_sse_line(&String::from_utf8_lossy(&buffer)) {
                let _ = tx.send(fragment).await;
            }
            tracing::debug!(%model, "chat stream completed");
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
