/// Knobs for the NTLMSSP mechanism.
///
/// The two `compat_*` switches re-enable legacy behavior that only exists
/// for interoperability with very old peers. Both are off by default.
#[derive(Debug, Clone, Default)]
pub struct NtlmConfig {
    /// Workstation name sent in NEGOTIATE and used as the challenge target.
    pub workstation: Option<String>,
    /// Accept the 56-bit/40-bit weakened sealing-key derivation when the
    /// peer refuses to negotiate a 128-bit session key.
    pub compat_weak_keys: bool,
    /// Accept AUTHENTICATE messages without a message integrity check.
    pub compat_missing_mic: bool,
}

impl NtlmConfig {
    pub fn new(workstation: String) -> Self {
        Self {
            workstation: Some(workstation),
            ..Default::default()
        }
    }
}
