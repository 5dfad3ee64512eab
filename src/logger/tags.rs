/// Log tags identify the subsystem a message comes from
///
/// Each tag maps to a `--debug-<key>` flag that enables its debug output.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LogTag {
    System,
    Service,
    Cluster,
    Events,
    Listener,
    Session,
    Config,
    License,
    Test,
    Other(String),
}

impl LogTag {
    /// Key used by `--debug-<key>` flags
    pub fn to_debug_key(&self) -> String {
        match self {
            LogTag::Other(name) => name.to_lowercase(),
            tag => tag.to_plain_string().to_lowercase(),
        }
    }

    /// Uncolored tag label for file output
    pub fn to_plain_string(&self) -> String {
        match self {
            LogTag::System => "SYSTEM".to_string(),
            LogTag::Service => "SERVICE".to_string(),
            LogTag::Cluster => "CLUSTER".to_string(),
            LogTag::Events => "EVENTS".to_string(),
            LogTag::Listener => "LISTENER".to_string(),
            LogTag::Session => "SESSION".to_string(),
            LogTag::Config => "CONFIG".to_string(),
            LogTag::License => "LICENSE".to_string(),
            LogTag::Test => "TEST".to_string(),
            LogTag::Other(name) => name.to_uppercase(),
        }
    }

    /// All built-in tags, used to generate debug flags
    pub fn all() -> &'static [LogTag] {
        &[
            LogTag::System,
            LogTag::Service,
            LogTag::Cluster,
            LogTag::Events,
            LogTag::Listener,
            LogTag::Session,
            LogTag::Config,
            LogTag::License,
        ]
    }
}

impl std::fmt::Display for LogTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_plain_string())
    }
}
