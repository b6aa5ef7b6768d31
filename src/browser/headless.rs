use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info};

/// 启动浏览器参数
#[derive(Debug, Clone)]
pub struct LaunchOptions<'a> {
    pub headless: bool,
    pub chrome_executable: Option<&'a str>,
    pub request_timeout: Duration,
}

/// 启动浏览器并打开空白页面
pub async fn launch_browser(options: LaunchOptions<'_>) -> Result<(Browser, Page, JoinHandle<()>)> {
    info!(
        "🚀 启动{}浏览器...",
        if options.headless { "无头" } else { "有界面" }
    );

    let mut builder = BrowserConfig::builder()
        .request_timeout(options.request_timeout)
        .window_size(1600, 1000)
        .args(vec![
            "--disable-gpu",           // 无头模式下禁用 GPU
            "--no-sandbox",            // 容器内没有沙盒权限
            "--disable-dev-shm-usage", // 防止共享内存不足
        ]);
    builder = if options.headless {
        builder.new_headless_mode()
    } else {
        builder.with_head()
    };
    if let Some(exe) = options.chrome_executable {
        debug!("浏览器可执行文件: {}", exe);
        builder = builder.chrome_executable(Path::new(exe));
    }

    let config = builder.build().map_err(|e| {
        error!("配置浏览器失败: {}", e);
        anyhow::anyhow!("配置浏览器失败: {}", e)
    })?;

    // 启动浏览器
    let (browser, mut handler) = Browser::launch(config).await.map_err(|e| {
        error!("启动浏览器失败: {}", e);
        anyhow::anyhow!("启动浏览器失败: {}", e)
    })?;
    debug!("浏览器启动成功");

    // 在后台处理浏览器事件
    let handler_task = tokio::spawn(async move {
        while let Some(h) = handler.next().await {
            if h.is_err() {
                break;
            }
        }
    });

    // 添加短暂延迟以等待浏览器状态同步
    sleep(tokio::time::Duration::from_millis(300)).await;

    let page = browser.new_page("about:blank").await.map_err(|e| {
        error!("创建页面失败: {}", e);
        anyhow::anyhow!("创建页面失败: {}", e)
    })?;

    Ok((browser, page, handler_task))
}
