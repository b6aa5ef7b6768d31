pub mod connection;
pub mod headless;

use anyhow::Result;
use chromiumoxide::{Browser, Page};
use tokio::task::JoinHandle;

use crate::config::Config;

pub use connection::connect_to_browser;
pub use headless::{launch_browser, LaunchOptions};

/// 按配置获取浏览器：配置了调试端口就连接，否则自行启动
///
/// # 返回
/// `(浏览器, 页面, 事件处理任务, 是否由本进程启动)`
pub async fn open_browser(config: &Config) -> Result<(Browser, Page, JoinHandle<()>, bool)> {
    match config.browser_debug_port {
        Some(port) => {
            let (browser, page, handler) = connect_to_browser(port).await?;
            Ok((browser, page, handler, false))
        }
        None => {
            let (browser, page, handler) = launch_browser(LaunchOptions {
                headless: config.browser_headless,
                chrome_executable: config.chrome_executable.as_deref(),
                request_timeout: config.page_load_timeout(),
            })
            .await?;
            Ok((browser, page, handler, true))
        }
    }
}
