//! 页面驱动 - 基础设施层
//!
//! 持有唯一的 page 资源，只暴露"导航 / 执行 JS / 等待元素 / 截图"的能力

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tokio::time::{sleep, timeout, Instant};

/// 轮询元素的间隔
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// 页面驱动
///
/// 职责：
/// - 持有唯一的 Page 资源
/// - 每个操作都有显式超时
/// - 不认识设备 / 图表
/// - 不处理业务流程
pub struct PageDriver {
    page: Page,
    page_load_timeout: Duration,
    wait_timeout: Duration,
}

impl PageDriver {
    /// 创建新的页面驱动
    pub fn new(page: Page, page_load_timeout: Duration, wait_timeout: Duration) -> Self {
        Self {
            page,
            page_load_timeout,
            wait_timeout,
        }
    }

    /// 获取 page 的引用（用于读取 cookie 等操作）
    pub fn page(&self) -> &Page {
        &self.page
    }

    /// 导航到指定地址并等待加载完成
    pub async fn goto(&self, url: &str) -> Result<()> {
        timeout(self.page_load_timeout, self.page.goto(url))
            .await
            .map_err(|_| anyhow!("页面加载超时: {}", url))?
            .with_context(|| format!("导航失败: {}", url))?;
        Ok(())
    }

    /// 等待由点击或提交引起的页面跳转
    pub async fn wait_for_navigation(&self) -> Result<()> {
        timeout(self.page_load_timeout, self.page.wait_for_navigation())
            .await
            .map_err(|_| anyhow!("等待页面跳转超时"))?
            .context("等待页面跳转失败")?;
        Ok(())
    }

    /// 当前页面地址
    pub async fn current_url(&self) -> Result<Option<String>> {
        Ok(self.page.url().await?)
    }

    /// 执行 JS 代码并返回 JSON 结果
    ///
    /// # 参数
    /// - `js_code`: 要执行的 JavaScript 代码
    ///
    /// # 返回
    /// 返回 JSON 值
    pub async fn eval(&self, js_code: impl Into<String>) -> Result<JsonValue> {
        let result = timeout(self.wait_timeout, self.page.evaluate(js_code.into()))
            .await
            .map_err(|_| anyhow!("脚本执行超时"))??;
        let json_value = result.into_value()?;
        Ok(json_value)
    }

    /// 执行 JS 代码并反序列化为指定类型
    pub async fn eval_as<T: DeserializeOwned>(&self, js_code: impl Into<String>) -> Result<T> {
        let json_value = self.eval(js_code).await?;
        let typed_value = serde_json::from_value(json_value)?;
        Ok(typed_value)
    }

    /// 轮询等待选择器命中
    ///
    /// # 返回
    /// 超时前命中返回 true
    pub async fn wait_for_selector(&self, selector: &str) -> Result<bool> {
        let deadline = Instant::now() + self.wait_timeout;
        let js = format!("!!document.querySelector({})", serde_json::to_string(selector)?);
        loop {
            if self.eval_as::<bool>(js.as_str()).await.unwrap_or(false) {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// 整页截图并写入文件
    pub async fn screenshot_to(&self, path: &Path) -> Result<()> {
        let bytes = timeout(
            self.wait_timeout,
            self.page
                .screenshot(ScreenshotParams::builder().full_page(true).build()),
        )
        .await
        .map_err(|_| anyhow!("截图超时"))??;
        tokio::fs::write(path, bytes)
            .await
            .with_context(|| format!("无法写入截图: {}", path.display()))?;
        Ok(())
    }
}
