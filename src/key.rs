use crate::config::EffectiveConfig;
use sha2::{Digest, Sha256};

/// Compute the process key for an effective config.
///
/// The key is a stable fingerprint over everything that affects what gets
/// spawned: fully-expanded argv, working directory, sorted extra env, sorted
/// passthrough names, the pass-all flag and the expanded upstream spec.
/// Requests with identical fingerprints share one backend. The request path
/// and query never enter the key unless a placeholder expanded them into one
/// of these fields.
pub fn process_key(config: &EffectiveConfig) -> String {
    let mut hasher = Sha256::new();

    section(&mut hasher, "argv", config.argv.iter().map(String::as_str));
    section(&mut hasher, "dir", config.dir.as_deref());

    let mut env = config.env.clone();
    env.sort();
    section(&mut hasher, "env", env.iter().map(String::as_str));

    let mut pass_env = config.pass_env.clone();
    pass_env.sort();
    section(&mut hasher, "pass_env", pass_env.iter().map(String::as_str));

    hasher.update([config.pass_all_env as u8]);
    section(&mut hasher, "upstream", Some(config.upstream_spec.as_str()));

    hex::encode(hasher.finalize())
}

/// Length-delimited field encoding so adjacent sections cannot collide
fn section<'a, I>(hasher: &mut Sha256, label: &str, fields: I)
where
    I: IntoIterator<Item = &'a str>,
{
    hasher.update(label.as_bytes());
    for field in fields {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field.as_bytes());
    }
    hasher.update([0xff]);
}
