//! # registry：服务端连接 ID 注册表
//!
//! ## 核心意图（Why）
//! - 重连请求只携带一个整数 ID，服务端需要据此找回存活的逻辑连接；
//! - ID 必须在存活连接之间唯一，连接关闭后可回收复用，避免长期运行后耗尽。
//!
//! ## 行为契约（What）
//! - `acquire_id`：预留一个未使用的 ID，耗尽时返回 `None`；
//! - `insert`：握手成功后把预留 ID 绑定到连接；
//! - `query_by_id`：只返回已绑定的存活连接，预留中的 ID 视为不存在；
//! - `release_id`：归还 ID，未被占用的 ID 归还为空操作。
//!
//! ## 风险提示（Trade-offs）
//! - 注册表只负责“ID → 连接”的映射，换挂竞争由连接自身的锁裁决，注册表不参与。

use std::{
    fmt,
    sync::atomic::{AtomicU32, Ordering},
};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use crate::conn::Conn;

/// 逻辑连接标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u32);

impl ConnId {
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ConnId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// 连接 ID 注册表契约。
///
/// 所有方法必须各自原子，且可被任意多个握手任务并发调用。
pub trait Registry: Send + Sync + 'static {
    /// 预留一个未使用的 ID。
    fn acquire_id(&self) -> Option<ConnId>;

    /// 归还 ID。
    fn release_id(&self, id: ConnId);

    /// 查询存活连接。
    fn query_by_id(&self, id: ConnId) -> Option<Conn>;

    /// 将预留 ID 绑定到连接；ID 未预留或已绑定时返回 `false`。
    fn insert(&self, id: ConnId, conn: Conn) -> bool;
}

#[derive(Debug)]
enum Slot {
    Reserved,
    Live(Conn),
}

/// 基于 `DashMap` 的默认注册表实现。
///
/// # 教案式注释
/// - **意图 (Why)**：分片哈希表让不同连接的注册与查询互不阻塞；
/// - **逻辑 (How)**：优先复用空闲链表中的 ID，其次递增计数器；计数器以
///   `fetch_update` 保证不越过 `max_conns`；
/// - **契约 (What)**：ID 取值范围为 `1..=max_conns`，`0` 保留给 NEW 请求占位。
#[derive(Debug)]
pub struct IdRegistry {
    slots: DashMap<ConnId, Slot>,
    free: Mutex<Vec<ConnId>>,
    next: AtomicU32,
    max_conns: u32,
}

impl Default for IdRegistry {
    fn default() -> Self {
        Self::new(u32::MAX - 1)
    }
}

impl IdRegistry {
    /// 创建最多容纳 `max_conns` 个存活连接的注册表。
    pub fn new(max_conns: u32) -> Self {
        Self {
            slots: DashMap::new(),
            free: Mutex::new(Vec::new()),
            next: AtomicU32::new(1),
            max_conns: max_conns.min(u32::MAX - 1),
        }
    }

    /// 已预留或已绑定的 ID 数量。
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// 已绑定连接的数量。
    pub fn live(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Live(_)))
            .count()
    }

    pub fn max_conns(&self) -> u32 {
        self.max_conns
    }
}

impl Registry for IdRegistry {
    fn acquire_id(&self) -> Option<ConnId> {
        let id = match self.free.lock().pop() {
            Some(id) => id,
            None => {
                let max = self.max_conns;
                let raw = self
                    .next
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                        (next <= max).then_some(next + 1)
                    })
                    .ok()?;
                ConnId(raw)
            }
        };
        self.slots.insert(id, Slot::Reserved);
        trace!(conn_id = %id, "connection id reserved");
        Some(id)
    }

    fn release_id(&self, id: ConnId) {
        if self.slots.remove(&id).is_some() {
            self.free.lock().push(id);
            trace!(conn_id = %id, "connection id released");
        }
    }

    fn query_by_id(&self, id: ConnId) -> Option<Conn> {
        match self.slots.get(&id)?.value() {
            Slot::Live(conn) => Some(conn.clone()),
            Slot::Reserved => None,
        }
    }

    fn insert(&self, id: ConnId, conn: Conn) -> bool {
        match self.slots.get_mut(&id) {
            Some(mut slot) if matches!(*slot, Slot::Reserved) => {
                *slot = Slot::Live(conn);
                true
            }
            _ => false,
        }
    }
}
