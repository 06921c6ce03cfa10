//! In-process repository configuration

/// Default maximum number of writes in one commit
pub const DEFAULT_MAX_OPS_PER_COMMIT: usize = 200;

/// Default maximum encoded record size (1 MiB)
pub const DEFAULT_MAX_RECORD_SIZE: usize = 1024 * 1024;

/// Limits and validation policy for a [`Repository`](crate::Repository)
///
/// ```
/// use arbor_repo::RepoConfig;
///
/// let config = RepoConfig::builder().max_ops_per_commit(50).build();
/// assert_eq!(config.max_ops_per_commit, 50);
/// assert!(config.strict_encoding);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder)]
pub struct RepoConfig {
    /// Maximum writes accepted in one `apply_writes` batch, and operations
    /// accepted in one incoming sync diff
    #[builder(default = DEFAULT_MAX_OPS_PER_COMMIT)]
    pub max_ops_per_commit: usize,

    /// Maximum encoded size of a single record block
    #[builder(default = DEFAULT_MAX_RECORD_SIZE)]
    pub max_record_size: usize,

    /// Reject node and commit blocks that are not canonical DAG-CBOR when
    /// importing sync payloads
    #[builder(default = true)]
    pub strict_encoding: bool,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
