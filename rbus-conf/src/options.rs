/// Overrides applied on top of file and environment configuration by the
/// embedding application.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Config filename
    pub cfg_name: Option<String>,

    /// Server name, overrides `node.name`
    pub server_name: Option<String>,

    /// Server pid, overrides `node.pid`
    pub server_pid: Option<u32>,
}
