// 浏览器端 Python 运行平台的服务端：容器生命周期 + 终端桥接。
pub mod api;
pub mod auth;
pub mod commands;
pub mod config;
pub mod container;
pub mod files;
pub mod pty;
pub mod runtime;
pub mod shutdown;
pub mod state;
pub mod storage;
pub mod terminal;
pub mod user_store;
