use clap::ValueEnum;

#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
pub enum VerifyMode {
    /// Verify only when a hash was given.
    Auto,
    /// Refuse to run without a hash.
    On,
    Off,
}
