//! 文字识别 - 业务能力层
//!
//! 只负责"一张图片 → 文字区域列表"，单张失败不影响其他图片
//!
//! ## 技术栈
//! - 使用 `async-openai` 调用兼容 OpenAI API 的视觉模型
//! - 图片以 base64 data URL 内联发送，不依赖外部图床

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImage,
        ChatCompletionRequestMessageContentPartText, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContent,
        ChatCompletionRequestUserMessageContentPart, CreateChatCompletionRequestArgs, ImageDetail,
        ImageUrl,
    },
    Client,
};
use base64::{engine::general_purpose, Engine as _};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::RecognitionError;
use crate::models::{BoundingRegion, TextRegion};
use crate::utils::truncate_text;

/// 识别协作方
///
/// 输入图片路径，输出按阅读顺序排列的文字区域。
pub trait Recognizer: Send + Sync {
    fn recognize<'a>(&'a self, image: &'a Path) -> BoxFuture<'a, Result<Vec<TextRegion>, RecognitionError>>;
}

const SYSTEM_PROMPT: &str = "You are an OCR engine. Transcribe every piece of text visible in the image \
exactly as printed, without fixing spelling or digits. Reply with a JSON array only, one element per \
text line: [{\"text\": \"...\", \"box\": [x, y, width, height]}], ordered top to bottom, left to right.";

const USER_PROMPT: &str = "Transcribe the text of this traffic graph, including the legend lines \
(Inbound / Outbound, Current / Average / Maximum) and the title.";

#[derive(Debug, Deserialize)]
struct RegionReply {
    text: String,
    #[serde(default, rename = "box")]
    bbox: Option<[f32; 4]>,
}

/// 基于视觉大模型的识别器
pub struct VisionLlmRecognizer {
    client: Client<OpenAIConfig>,
    model_name: String,
}

impl VisionLlmRecognizer {
    /// 创建新的识别器
    pub fn new(config: &Config) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(&config.ocr_api_key)
            .with_api_base(&config.ocr_api_base_url);

        Self {
            client: Client::with_config(openai_config),
            model_name: config.ocr_model_name.clone(),
        }
    }

    async fn recognize_image(&self, image: &Path) -> Result<Vec<TextRegion>> {
        let bytes = tokio::fs::read(image)
            .await
            .with_context(|| format!("无法读取图片: {}", image.display()))?;
        if bytes.is_empty() {
            return Err(anyhow!("图片为空"));
        }
        let data_url = format!(
            "data:{};base64,{}",
            mime_type(image),
            general_purpose::STANDARD.encode(&bytes)
        );
        debug!("调用识别模型 {}，图片 {} 字节", self.model_name, bytes.len());

        let system_msg = ChatCompletionRequestSystemMessageArgs::default()
            .content(SYSTEM_PROMPT)
            .build()?;

        let content_parts = vec![
            ChatCompletionRequestUserMessageContentPart::Text(
                ChatCompletionRequestMessageContentPartText {
                    text: USER_PROMPT.to_string(),
                },
            ),
            ChatCompletionRequestUserMessageContentPart::ImageUrl(
                ChatCompletionRequestMessageContentPartImage {
                    image_url: ImageUrl {
                        url: data_url,
                        detail: Some(ImageDetail::High),
                    },
                },
            ),
        ];
        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(ChatCompletionRequestUserMessageContent::Array(content_parts))
            .build()?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model_name)
            .messages(vec![
                ChatCompletionRequestMessage::System(system_msg),
                ChatCompletionRequestMessage::User(user_msg),
            ])
            .temperature(0.0)
            .max_tokens(2048u32)
            .build()?;

        let response = self.client.chat().create(request).await.map_err(|e| {
            warn!("识别模型调用失败: {}", e);
            anyhow!("识别模型调用失败: {}", e)
        })?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| anyhow!("识别模型返回内容为空"))?;

        debug!("识别结果: {}", truncate_text(&content, 120));
        Ok(parse_regions(&content))
    }
}

impl Recognizer for VisionLlmRecognizer {
    fn recognize<'a>(&'a self, image: &'a Path) -> BoxFuture<'a, Result<Vec<TextRegion>, RecognitionError>> {
        async move {
            self.recognize_image(image)
                .await
                .map_err(|e| RecognitionError::new(image.display().to_string(), format!("{:#}", e)))
        }
        .boxed()
    }
}

fn mime_type(image: &Path) -> &'static str {
    match image
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/png",
    }
}

/// 解析模型回复
///
/// 优先按 JSON 数组解析；模型没有按格式回复时，按行切分为无坐标的区域。
pub fn parse_regions(content: &str) -> Vec<TextRegion> {
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    if let Ok(replies) = serde_json::from_str::<Vec<RegionReply>>(trimmed) {
        return replies
            .into_iter()
            .filter(|r| !r.text.trim().is_empty())
            .map(|r| TextRegion {
                text: r.text,
                bounds: r.bbox.map(|[x, y, width, height]| BoundingRegion {
                    x,
                    y,
                    width,
                    height,
                }),
            })
            .collect();
    }

    trimmed
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| TextRegion {
            text: line.to_string(),
            bounds: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_regions() {
        let reply = r#"```json
[{"text": "Inbound Current: 1O0 Kbps", "box": [10, 20, 200, 14]}, {"text": "  "}, {"text": "Outbound"}]
```"#;
        let regions = parse_regions(reply);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].text, "Inbound Current: 1O0 Kbps");
        assert_eq!(regions[0].bounds.unwrap().width, 200.0);
        assert!(regions[1].bounds.is_none());
    }

    #[test]
    fn test_parse_plain_text_fallback() {
        let regions = parse_regions("Inbound Current: 5 M\n\nOutbound Current: 7 M\n");
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[1].text, "Outbound Current: 7 M");
    }

    #[test]
    fn test_mime_type() {
        assert_eq!(mime_type(Path::new("a.PNG")), "image/png");
        assert_eq!(mime_type(Path::new("a.jpeg")), "image/jpeg");
    }

    #[tokio::test]
    async fn test_missing_image_is_a_recognition_error() {
        let recognizer = VisionLlmRecognizer::new(&Config::default());
        let err = recognizer
            .recognize(Path::new("no/such/image.png"))
            .await
            .unwrap_err();
        assert!(err.image.contains("image.png"));
    }

    #[tokio::test]
    #[ignore] // 需要可用的识别模型接口
    async fn test_recognize_live() {
        let _ = tracing_subscriber::fmt::try_init();
        let config = Config::from_env();
        let recognizer = VisionLlmRecognizer::new(&config);
        let image = std::env::var("SAMPLE_GRAPH").unwrap_or_else(|_| "sample_graph.png".to_string());
        let regions = recognizer
            .recognize(Path::new(&image))
            .await
            .unwrap();
        for region in regions {
            println!("{:?}", region);
        }
    }
}
