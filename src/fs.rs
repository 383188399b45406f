//! 进程持有的文件系统对象
//!
//! 文件系统本身不在内核核心里实现，这里只规定进程表需要的两类句柄：
//! 打开的文件和当前工作目录。两者都以 `Arc` 共享，`fork` 时增加引用，
//! 进程退出时释放引用，最后一个引用消失时由实现者完成关闭。

/// 一个打开的文件
pub trait File: Send + Sync {}

/// 一个目录或文件的索引节点
pub trait Inode: Send + Sync {}
