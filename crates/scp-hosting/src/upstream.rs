use std::time::Duration;

use rand::Rng;
use tokio::net::TcpStream;
use tracing::debug;

use crate::{error::HostingError, settings::UpstreamSettings};

/// 一个上游服务。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Upstream {
    pub name: String,
    pub addr: String,
    pub weight: u32,
}

impl From<&UpstreamSettings> for Upstream {
    fn from(settings: &UpstreamSettings) -> Self {
        Self {
            name: settings.name.clone(),
            addr: settings.addr.clone(),
            weight: settings.weight,
        }
    }
}

/// 上游集合。
///
/// # 教案级注释
///
/// ## 契约说明（What）
/// - `pick(Some(name))`：按名字精确匹配；名字未知时退回加权随机；
/// - `pick(None)`：按权重随机选择，权重为 0 的上游永不被选中；
/// - `connect`：在超时内建立到所选上游的 TCP 连接。
#[derive(Clone, Debug, Default)]
pub struct Upstreams {
    entries: Vec<Upstream>,
    total_weight: u64,
}

impl Upstreams {
    pub fn new(entries: Vec<Upstream>) -> Self {
        let total_weight = entries.iter().map(|entry| u64::from(entry.weight)).sum();
        Self {
            entries,
            total_weight,
        }
    }

    pub fn from_settings(settings: &[UpstreamSettings]) -> Self {
        Self::new(settings.iter().map(Upstream::from).collect())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Upstream> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    pub fn pick(&self, target: Option<&str>) -> Option<&Upstream> {
        if let Some(name) = target
            && let Some(found) = self.get(name)
        {
            return Some(found);
        }
        if self.total_weight == 0 {
            return None;
        }
        let mut point = rand::rng().random_range(0..self.total_weight);
        for entry in &self.entries {
            let weight = u64::from(entry.weight);
            if point < weight {
                return Some(entry);
            }
            point -= weight;
        }
        None
    }

    /// 选择上游并建立 TCP 连接。
    pub async fn connect(
        &self,
        target: Option<&str>,
        timeout: Duration,
    ) -> Result<(Upstream, TcpStream), HostingError> {
        let upstream = self
            .pick(target)
            .cloned()
            .ok_or_else(|| HostingError::NoUpstream {
                target: target.map(str::to_owned),
            })?;
        let connecting = TcpStream::connect(upstream.addr.as_str());
        let stream = match tokio::time::timeout(timeout, connecting).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(upstream_error(&upstream, source)),
            Err(_) => {
                let source = std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out");
                return Err(upstream_error(&upstream, source));
            }
        };
        let _ = stream.set_nodelay(true);
        debug!(upstream = %upstream.name, addr = %upstream.addr, "upstream connected");
        Ok((upstream, stream))
    }
}

pub(crate) fn upstream_error(upstream: &Upstream, source: std::io::Error) -> HostingError {
    HostingError::Upstream {
        name: upstream.name.clone(),
        addr: upstream.addr.clone(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstreams() -> Upstreams {
        Upstreams::new(vec![
            Upstream {
                name: "a".into(),
                addr: "127.0.0.1:1".into(),
                weight: 1,
            },
            Upstream {
                name: "b".into(),
                addr: "127.0.0.1:2".into(),
                weight: 0,
            },
            Upstream {
                name: "c".into(),
                addr: "127.0.0.1:3".into(),
                weight: 3,
            },
        ])
    }

    #[test]
    fn named_target_wins() {
        let upstreams = upstreams();
        assert_eq!(upstreams.pick(Some("b")).map(|u| u.name.as_str()), Some("b"));
    }

    #[test]
    fn weighted_pick_skips_zero_weight() {
        let upstreams = upstreams();
        let mut counts = [0usize; 3];
        for _ in 0..4000 {
            match upstreams.pick(Some("unknown")).map(|u| u.name.as_str()) {
                Some("a") => counts[0] += 1,
                Some("b") => counts[1] += 1,
                Some("c") => counts[2] += 1,
                other => panic!("unexpected pick {other:?}"),
            }
        }
        assert_eq!(counts[1], 0);
        assert!(counts[2] > counts[0], "weight 3 beats weight 1: {counts:?}");
    }

    #[test]
    fn empty_set_has_no_pick() {
        assert!(Upstreams::default().pick(None).is_none());
    }

    #[tokio::test]
    async fn refused_connect_names_the_upstream() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        drop(listener);
        let upstreams = Upstreams::new(vec![Upstream {
            name: "gone".into(),
            addr,
            weight: 1,
        }]);
        let err = upstreams
            .connect(None, Duration::from_secs(1))
            .await
            .expect_err("refused");
        assert_eq!(err.code(), "scp.hosting.upstream_connect_failed");
        assert!(err.to_string().contains("gone"));
    }
}
