//! Feature names exchanged in the CNXN banner.

pub const SHELL_V2: &str = "shell_v2";
pub const CMD: &str = "cmd";
pub const STAT_V2: &str = "stat_v2";
pub const LS_V2: &str = "ls_v2";
pub const FIXED_PUSH_MKDIR: &str = "fixed_push_mkdir";
pub const APEX: &str = "apex";
pub const ABB: &str = "abb";
pub const FIXED_PUSH_SYMLINK_TIMESTAMP: &str = "fixed_push_symlink_timestamp";
pub const ABB_EXEC: &str = "abb_exec";
pub const REMOUNT_SHELL: &str = "remount_shell";
pub const TRACK_APP: &str = "track_app";
pub const SENDRECV_V2: &str = "sendrecv_v2";
pub const SENDRECV_V2_BROTLI: &str = "sendrecv_v2_brotli";
pub const SENDRECV_V2_LZ4: &str = "sendrecv_v2_lz4";
pub const SENDRECV_V2_ZSTD: &str = "sendrecv_v2_zstd";
pub const SENDRECV_V2_DRY_RUN_SEND: &str = "sendrecv_v2_dry_run_send";
/// Byte-budget flow control instead of one OKAY per WRTE.
pub const DELAYED_ACK: &str = "delayed_ack";

/// Features advertised by default, matching a current `adb` host.
pub const DEFAULT_FEATURES: &[&str] = &[
    SHELL_V2,
    CMD,
    STAT_V2,
    LS_V2,
    FIXED_PUSH_MKDIR,
    APEX,
    ABB,
    FIXED_PUSH_SYMLINK_TIMESTAMP,
    ABB_EXEC,
    REMOUNT_SHELL,
    TRACK_APP,
    SENDRECV_V2,
    SENDRECV_V2_BROTLI,
    SENDRECV_V2_LZ4,
    SENDRECV_V2_ZSTD,
    SENDRECV_V2_DRY_RUN_SEND,
    DELAYED_ACK,
];

pub fn default_features() -> Vec<String> {
    DEFAULT_FEATURES.iter().map(|f| f.to_string()).collect()
}
