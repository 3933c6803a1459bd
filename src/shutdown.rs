// 停机信号：Ctrl+C 与 SIGTERM 任一到达即返回，交给上层做收尾。
use tracing::{error, info};

pub async fn shutdown_signal() {
    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Ctrl+C 监听注册失败: {err}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                // 注册失败时只剩 Ctrl+C 一条路径，不拉垮进程。
                error!("SIGTERM 监听注册失败: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {},
        _ = terminate => {},
    }

    info!("停机信号到达，开始收尾");
}
