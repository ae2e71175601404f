use redis::aio::ConnectionManager;

/// A server-side atomic operation, compiled once per process.
///
/// Scripts are addressed by the SHA-1 digest of their source: invocation
/// issues EVALSHA and, when the shard answers NOSCRIPT (it restarted or was
/// flushed), loads the source and retries once. The script primitive handles
/// that reload; this wrapper pins the digest for logging and keeps the
/// key/arg plumbing in one place.
pub struct ClusterScript {
    script: redis::Script,
}

impl ClusterScript {
    pub fn new(source: &str) -> Self {
        Self {
            script: redis::Script::new(source),
        }
    }

    /// SHA-1 digest the shards know this script by.
    pub fn digest(&self) -> &str {
        self.script.get_hash()
    }

    pub(crate) async fn invoke<T: redis::FromRedisValue>(
        &self,
        conn: &mut ConnectionManager,
        keys: &[String],
        args: &[String],
    ) -> redis::RedisResult<T> {
        let mut invocation = self.script.prepare_invoke();
        for key in keys {
            invocation.key(key.as_str());
        }
        for arg in args {
            invocation.arg(arg.as_str());
        }
        invocation.invoke_async(conn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_per_source() {
        let a = ClusterScript::new("return 1");
        let b = ClusterScript::new("return 1");
        let c = ClusterScript::new("return 2");
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
        assert_eq!(a.digest().len(), 40);
    }
}
