//! 图表采集 - 业务能力层
//!
//! ## 职责
//!
//! - 登录监控平台并设置统计时间范围（一次会话）
//! - 按设备过滤图表，进入放大视图，下载图表图片
//! - 找不到图表时保存诊断截图
//!
//! 错误区分临时性（可重试）与致命（不可重试），由调用方决定重试策略。
//! 所有浏览器操作都有显式超时。

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::Context;
use chromiumoxide::Browser;
use futures::future::BoxFuture;
use futures::FutureExt;
use regex::Regex;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::browser;
use crate::config::{mask_sensitive, Config};
use crate::error::CollaboratorError;
use crate::infrastructure::PageDriver;

/// 一次采集会话的输入
#[derive(Debug, Clone)]
pub struct ScrapeRequest {
    pub target_url: String,
    pub username: String,
    pub password: String,
    pub date_from: String,
    pub date_to: String,
}

/// 采集协作方
///
/// 会话内按设备逐个采集，方便调用方逐项汇报进度、检查取消。
pub trait GraphScraper: Send + Sync {
    /// 登录并设置时间范围
    fn open_session<'a>(&'a self, request: &'a ScrapeRequest) -> BoxFuture<'a, Result<(), CollaboratorError>>;

    /// 采集一个设备的图表，图片写入 `images_dir`
    ///
    /// # 返回
    /// 返回图片路径
    fn capture_graph<'a>(
        &'a self,
        device: &'a str,
        images_dir: &'a Path,
        diagnostics_dir: &'a Path,
    ) -> BoxFuture<'a, Result<PathBuf, CollaboratorError>>;

    /// 结束会话，释放浏览器
    fn close_session(&self) -> BoxFuture<'_, ()>;
}

static UNSAFE_FILENAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[\\/:*?"<>|\s]+"#).expect("valid regex"));

/// 设备名转换为安全的文件名
pub fn sanitize_filename(name: &str) -> String {
    let cleaned = UNSAFE_FILENAME_CHARS.replace_all(name.trim(), "_");
    let cleaned: String = cleaned.chars().take(120).collect();
    if cleaned.is_empty() {
        "graph".to_string()
    } else {
        cleaned
    }
}

// ========== 页面脚本 ==========

const NO_DATA_MARKERS: [&str; 3] = [
    "No data sources present",
    "Tidak ada data",
    "No matching records found",
];

fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

fn login_script(username: &str, password: &str) -> String {
    format!(
        r#"(() => {{
    const user = document.querySelector("input[name='login_username']");
    const pass = document.querySelector("input[name='login_password']");
    if (!user || !pass) return false;
    user.value = {};
    pass.value = {};
    const button = document.querySelector(".button--primary, input[type='submit'], button[type='submit']");
    if (button) {{ button.click(); }} else {{ user.form && user.form.submit(); }}
    return true;
}})()"#,
        js_string(username),
        js_string(password)
    )
}

fn date_range_script(from: &str, to: &str) -> String {
    format!(
        r#"(() => {{
    const d1 = document.getElementById("date1");
    const d2 = document.getElementById("date2");
    if (!d1 || !d2) return false;
    d1.value = {};
    d2.value = {};
    const refresh = document.querySelector("input[name='button_refresh_x'], #button_refresh_x");
    if (refresh) {{ refresh.click(); }} else {{ d1.form && d1.form.submit(); }}
    return true;
}})()"#,
        js_string(from),
        js_string(to)
    )
}

fn filter_script(device: &str) -> String {
    format!(
        r#"(() => {{
    const filter = document.querySelector("input[name='filter'], #filter");
    if (!filter) return false;
    filter.value = {};
    const go = document.querySelector("input[value='Go'][title='Set/Refresh Filters'], input[value='Go'], #refresh");
    if (go) {{ go.click(); }} else {{ filter.form && filter.form.submit(); }}
    return true;
}})()"#,
        js_string(device)
    )
}

const PAGE_TEXT_SCRIPT: &str = "document.body ? document.body.innerText : ''";

const ZOOM_LINK_SCRIPT: &str = r#"(() => {
    const link = document.querySelector("a[href*='graph.php?action=zoom']");
    return link ? link.href : null;
})()"#;

const GRAPH_IMAGE_SCRIPT: &str = r#"(() => {
    const img = document.querySelector("img[src*='graph_image.php']");
    return img ? img.src : null;
})()"#;

// ========== 浏览器实现 ==========

struct CactiSession {
    browser: Browser,
    driver: PageDriver,
    handler: JoinHandle<()>,
    launched: bool,
    /// 登录并设置时间后的图表列表页
    list_url: String,
}

/// 基于 chromiumoxide 的 CACTI 图表采集器
pub struct CactiScraper {
    config: Config,
    http: reqwest::Client,
    session: Mutex<Option<CactiSession>>,
}

impl CactiScraper {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("无法创建 HTTP 客户端")?;
        Ok(Self {
            config: config.clone(),
            http,
            session: Mutex::new(None),
        })
    }

    async fn login(&self, request: &ScrapeRequest) -> Result<CactiSession, CollaboratorError> {
        info!(
            "🔐 登录 {} (用户 {})",
            request.target_url,
            mask_sensitive(&request.username)
        );

        let (browser, page, handler, launched) = browser::open_browser(&self.config)
            .await
            .map_err(|e| CollaboratorError::Transient(format!("浏览器不可用: {:#}", e)))?;
        let driver = PageDriver::new(page, self.config.page_load_timeout(), self.config.wait_timeout());

        let mut session = CactiSession {
            browser,
            driver,
            handler,
            launched,
            list_url: request.target_url.clone(),
        };
        match self.prepare_session(&mut session, request).await {
            Ok(()) => Ok(session),
            Err(e) => {
                shutdown(session).await;
                Err(e)
            }
        }
    }

    async fn prepare_session(
        &self,
        session: &mut CactiSession,
        request: &ScrapeRequest,
    ) -> Result<(), CollaboratorError> {
        let driver = &session.driver;
        driver.goto(&request.target_url).await.map_err(transient)?;

        if driver
            .wait_for_selector("input[name='login_username']")
            .await
            .map_err(transient)?
        {
            let submitted: bool = driver
                .eval_as(login_script(&request.username, &request.password))
                .await
                .map_err(transient)?;
            if !submitted {
                return Err(CollaboratorError::Fatal("找不到登录表单".to_string()));
            }
            // 表单提交后页面可能已经跳转完成，这里的超时不算失败
            let _ = driver.wait_for_navigation().await;
        } else {
            debug!("页面没有登录表单，沿用已有会话");
        }

        if !driver.wait_for_selector("#date1").await.map_err(transient)? {
            return Err(CollaboratorError::Fatal(
                "登录失败或页面结构不符合预期（找不到时间范围输入框）".to_string(),
            ));
        }

        let applied: bool = driver
            .eval_as(date_range_script(&request.date_from, &request.date_to))
            .await
            .map_err(transient)?;
        if !applied {
            return Err(CollaboratorError::Fatal("无法设置时间范围".to_string()));
        }
        let _ = driver.wait_for_navigation().await;

        if let Some(url) = driver.current_url().await.map_err(transient)? {
            session.list_url = url;
        }
        info!("✓ 已登录，时间范围 {} ~ {}", request.date_from, request.date_to);
        Ok(())
    }

    async fn capture(
        &self,
        session: &CactiSession,
        device: &str,
        images_dir: &Path,
        diagnostics_dir: &Path,
    ) -> Result<PathBuf, CollaboratorError> {
        let driver = &session.driver;
        driver.goto(&session.list_url).await.map_err(transient)?;

        let filtered: bool = driver.eval_as(filter_script(device)).await.map_err(transient)?;
        if !filtered {
            return Err(CollaboratorError::Fatal("找不到图表过滤输入框".to_string()));
        }
        let _ = driver.wait_for_navigation().await;

        let page_text: String = driver.eval_as(PAGE_TEXT_SCRIPT).await.map_err(transient)?;
        if let Some(marker) = NO_DATA_MARKERS.iter().find(|m| page_text.contains(**m)) {
            self.save_diagnostics(driver, device, diagnostics_dir).await;
            return Err(CollaboratorError::NoData(format!("{}: {}", device, marker)));
        }

        driver
            .wait_for_selector("a[href*='graph.php?action=zoom']")
            .await
            .map_err(transient)?;
        let zoom_url: Option<String> = driver.eval_as(ZOOM_LINK_SCRIPT).await.map_err(transient)?;
        let Some(zoom_url) = zoom_url else {
            self.save_diagnostics(driver, device, diagnostics_dir).await;
            return Err(CollaboratorError::NoData(format!("{}: 找不到放大链接", device)));
        };

        debug!("放大视图: {}", zoom_url);
        driver.goto(&zoom_url).await.map_err(transient)?;
        if !driver
            .wait_for_selector("img[src*='graph_image.php']")
            .await
            .map_err(transient)?
        {
            return Err(CollaboratorError::Transient(format!("{}: 图表图片未加载", device)));
        }
        let image_url: Option<String> = driver.eval_as(GRAPH_IMAGE_SCRIPT).await.map_err(transient)?;
        let image_url = image_url
            .ok_or_else(|| CollaboratorError::Transient(format!("{}: 找不到图表图片", device)))?;

        let bytes = self.download(driver, &image_url).await?;
        let path = images_dir.join(format!("{}.png", sanitize_filename(device)));
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| CollaboratorError::Fatal(format!("无法写入图片 {}: {}", path.display(), e)))?;

        debug!("图表已保存: {} ({} 字节)", path.display(), bytes.len());
        Ok(path)
    }

    /// 带会话 cookie 下载图表图片
    async fn download(&self, driver: &PageDriver, image_url: &str) -> Result<Vec<u8>, CollaboratorError> {
        let cookies = driver.page().get_cookies().await.map_err(|e| transient(e.into()))?;
        let cookie_header = cookies
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ");

        let response = self
            .http
            .get(image_url)
            .header(reqwest::header::COOKIE, cookie_header)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    CollaboratorError::Transient(format!("下载图表失败: {}", e))
                } else {
                    CollaboratorError::Fatal(format!("下载图表失败: {}", e))
                }
            })?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(CollaboratorError::Transient(format!("下载图表返回 {}", status)));
        }
        if !status.is_success() {
            return Err(CollaboratorError::Fatal(format!("下载图表返回 {}", status)));
        }

        let is_image = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or(true, |v| v.starts_with("image/"));
        if !is_image {
            return Err(CollaboratorError::Fatal("下载内容不是图片（会话可能已失效）".to_string()));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| CollaboratorError::Transient(format!("读取图表内容失败: {}", e)))?;
        Ok(bytes.to_vec())
    }

    async fn save_diagnostics(&self, driver: &PageDriver, device: &str, diagnostics_dir: &Path) {
        let path = diagnostics_dir.join(format!("no_graph_{}.png", sanitize_filename(device)));
        match driver.screenshot_to(&path).await {
            Ok(()) => info!("📸 已保存诊断截图: {}", path.display()),
            Err(e) => warn!("⚠️ 保存诊断截图失败: {:#}", e),
        }
    }
}

fn transient(e: anyhow::Error) -> CollaboratorError {
    CollaboratorError::Transient(format!("{:#}", e))
}

async fn shutdown(mut session: CactiSession) {
    if session.launched {
        if let Err(e) = session.browser.close().await {
            debug!("关闭浏览器失败: {}", e);
        }
        let _ = session.browser.wait().await;
    }
    session.handler.abort();
}

impl GraphScraper for CactiScraper {
    fn open_session<'a>(&'a self, request: &'a ScrapeRequest) -> BoxFuture<'a, Result<(), CollaboratorError>> {
        async move {
            let mut guard = self.session.lock().await;
            if let Some(old) = guard.take() {
                shutdown(old).await;
            }
            *guard = Some(self.login(request).await?);
            Ok(())
        }
        .boxed()
    }

    fn capture_graph<'a>(
        &'a self,
        device: &'a str,
        images_dir: &'a Path,
        diagnostics_dir: &'a Path,
    ) -> BoxFuture<'a, Result<PathBuf, CollaboratorError>> {
        async move {
            let guard = self.session.lock().await;
            let session = guard
                .as_ref()
                .ok_or_else(|| CollaboratorError::Fatal("采集会话尚未建立".to_string()))?;
            self.capture(session, device, images_dir, diagnostics_dir).await
        }
        .boxed()
    }

    fn close_session(&self) -> BoxFuture<'_, ()> {
        async move {
            if let Some(session) = self.session.lock().await.take() {
                shutdown(session).await;
                debug!("采集会话已关闭");
            }
        }
        .boxed()
    }
}
