use std::str::FromStr;
use std::time::Duration;

use crate::models::BandwidthUnit;
use crate::services::normalizer::UnitHeuristic;
use crate::utils::retry::RetryPolicy;
use crate::workflow::FailurePolicy;

/// 程序配置
#[derive(Clone, Debug)]
pub struct Config {
    /// 所有运行目录的父目录
    pub output_root: String,
    /// 日志目录（None 表示只输出到控制台）
    pub log_dir: Option<String>,
    /// 是否显示详细日志
    pub verbose_logging: bool,

    // --- 浏览器配置 ---
    /// 连接已打开浏览器的调试端口；为空时自行启动浏览器
    pub browser_debug_port: Option<u16>,
    pub browser_headless: bool,
    pub chrome_executable: Option<String>,
    /// 等待页面元素出现的超时（秒）
    pub wait_timeout_secs: u64,
    /// 页面导航超时（秒）
    pub page_load_timeout_secs: u64,
    /// 图表图片下载超时（秒）
    pub request_timeout_secs: u64,
    /// 允许的目标地址前缀，空表示不限制
    pub allowed_target_urls: Vec<String>,

    // --- 重试配置 ---
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,

    // --- 识别配置 ---
    /// 并发识别的图片数量
    pub ocr_workers: usize,
    /// 单张图片识别超时（秒）
    pub ocr_timeout_secs: u64,
    pub ocr_api_key: String,
    pub ocr_api_base_url: String,
    pub ocr_model_name: String,

    // --- 阶段策略 ---
    /// 子项失败率超过该值时阶段立即失败
    pub stage_max_failure_rate: f64,

    // --- 单位推断 ---
    pub unit_threshold: f64,
    pub unit_below_threshold: BandwidthUnit,
    pub unit_at_or_above_threshold: BandwidthUnit,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_root: "output".to_string(),
            log_dir: Some("Debug".to_string()),
            verbose_logging: false,
            browser_debug_port: None,
            browser_headless: true,
            chrome_executable: None,
            wait_timeout_secs: 15,
            page_load_timeout_secs: 30,
            request_timeout_secs: 30,
            allowed_target_urls: Vec::new(),
            retry_max_attempts: 3,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 60_000,
            ocr_workers: 2,
            ocr_timeout_secs: 120,
            ocr_api_key: String::new(),
            ocr_api_base_url: "https://api.openai.com/v1".to_string(),
            ocr_model_name: "gpt-4o-mini".to_string(),
            stage_max_failure_rate: 0.5,
            unit_threshold: 1000.0,
            unit_below_threshold: BandwidthUnit::Mbps,
            unit_at_or_above_threshold: BandwidthUnit::Kbps,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            output_root: std::env::var("OUTPUT_DIR").unwrap_or(default.output_root),
            log_dir: match std::env::var("LOG_DIR") {
                Ok(v) if v.trim().is_empty() => None,
                Ok(v) => Some(v),
                Err(_) => default.log_dir,
            },
            verbose_logging: env_parse("VERBOSE_LOGGING", default.verbose_logging),
            browser_debug_port: std::env::var("BROWSER_DEBUG_PORT").ok().and_then(|v| v.parse().ok()).or(default.browser_debug_port),
            browser_headless: env_parse("BROWSER_HEADLESS", default.browser_headless),
            chrome_executable: std::env::var("CHROME_EXECUTABLE").ok().or(default.chrome_executable),
            wait_timeout_secs: env_parse("WAIT_TIMEOUT", default.wait_timeout_secs),
            page_load_timeout_secs: env_parse("PAGE_LOAD_TIMEOUT", default.page_load_timeout_secs),
            request_timeout_secs: env_parse("REQUEST_TIMEOUT", default.request_timeout_secs),
            allowed_target_urls: std::env::var("ALLOWED_TARGET_URLS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or(default.allowed_target_urls),
            retry_max_attempts: env_parse("RETRY_MAX_ATTEMPTS", default.retry_max_attempts),
            retry_base_delay_ms: env_parse("RETRY_BASE_DELAY_MS", default.retry_base_delay_ms),
            retry_max_delay_ms: env_parse("RETRY_MAX_DELAY_MS", default.retry_max_delay_ms),
            ocr_workers: env_parse("OCR_WORKERS", default.ocr_workers),
            ocr_timeout_secs: env_parse("OCR_TIMEOUT", default.ocr_timeout_secs),
            ocr_api_key: std::env::var("OCR_API_KEY").unwrap_or(default.ocr_api_key),
            ocr_api_base_url: std::env::var("OCR_API_BASE_URL").unwrap_or(default.ocr_api_base_url),
            ocr_model_name: std::env::var("OCR_MODEL_NAME").unwrap_or(default.ocr_model_name),
            stage_max_failure_rate: env_parse("STAGE_MAX_FAILURE_RATE", default.stage_max_failure_rate),
            unit_threshold: env_parse("UNIT_HEURISTIC_THRESHOLD", default.unit_threshold),
            unit_below_threshold: env_parse("UNIT_BELOW_THRESHOLD", default.unit_below_threshold),
            unit_at_or_above_threshold: env_parse("UNIT_AT_OR_ABOVE_THRESHOLD", default.unit_at_or_above_threshold),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter: true,
        }
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::new(self.stage_max_failure_rate)
    }

    pub fn unit_heuristic(&self) -> UnitHeuristic {
        UnitHeuristic {
            threshold: self.unit_threshold,
            below: self.unit_below_threshold,
            at_or_above: self.unit_at_or_above_threshold,
        }
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn page_load_timeout(&self) -> Duration {
        Duration::from_secs(self.page_load_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn ocr_timeout(&self) -> Duration {
        Duration::from_secs(self.ocr_timeout_secs)
    }

    /// 校验目标地址
    ///
    /// # 返回
    /// 不合法时返回原因
    pub fn validate_target_url(&self, url: &str) -> Result<(), String> {
        let url = url.trim();
        if url.is_empty() {
            return Err("目标地址为空".to_string());
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(format!("目标地址必须以 http:// 或 https:// 开头: {}", url));
        }
        if !self.allowed_target_urls.is_empty()
            && !self.allowed_target_urls.iter().any(|allowed| url.starts_with(allowed.as_str()))
        {
            return Err(format!("目标地址不在允许列表中: {}", url));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

/// 遮蔽敏感信息，只保留前 4 个字符
pub fn mask_sensitive(value: &str) -> String {
    let visible: String = value.chars().take(4).collect();
    if value.chars().count() <= 4 {
        "*".repeat(value.chars().count())
    } else {
        format!("{}****", visible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_target_url() {
        let mut config = Config::default();
        assert!(config.validate_target_url("https://cacti.example.net/cacti/").is_ok());
        assert!(config.validate_target_url("ftp://cacti.example.net").is_err());
        assert!(config.validate_target_url("  ").is_err());

        config.allowed_target_urls = vec!["https://cacti.example.net".to_string()];
        assert!(config.validate_target_url("https://cacti.example.net/graph_view.php").is_ok());
        assert!(config.validate_target_url("https://other.example.net/").is_err());
    }

    #[test]
    fn test_mask_sensitive() {
        assert_eq!(mask_sensitive("secret-password"), "secr****");
        assert_eq!(mask_sensitive("abc"), "***");
    }

    #[test]
    fn test_default_unit_heuristic() {
        let heuristic = Config::default().unit_heuristic();
        assert_eq!(heuristic.threshold, 1000.0);
        assert_eq!(heuristic.below, BandwidthUnit::Mbps);
        assert_eq!(heuristic.at_or_above, BandwidthUnit::Kbps);
    }
}
