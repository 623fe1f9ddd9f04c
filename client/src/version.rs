/// The distributor of this Arrears client.
///
/// Common values include `arrears`, `docker` and `dev`.
pub const ARREARS_DISTRIBUTOR: &str = if let Some(distro) = option_env!("ARREARS_DISTRIBUTOR") {
    distro
} else {
    "unknown"
};
