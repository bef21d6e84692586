use sha2::{Digest, Sha256};

use crate::store::InputFile;

/// SHA-256 digest of a canonicalized file set.
///
/// Two file sets fingerprint equal iff they contain the same paths with the
/// same contents and executable flags, regardless of declaration order.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of_files(files: &[InputFile]) -> Self {
        let mut entries: Vec<&InputFile> = files.iter().collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        let mut hasher = Sha256::new();
        for file in entries {
            // Length-prefix every field so entry boundaries are unambiguous.
            hasher.update((file.path.len() as u64).to_le_bytes());
            hasher.update(file.path.as_bytes());
            hasher.update([u8::from(file.executable)]);
            hasher.update((file.contents.len() as u64).to_le_bytes());
            hasher.update(&file.contents);
        }
        Self(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, contents: &[u8], executable: bool) -> InputFile {
        InputFile {
            path: path.to_string(),
            contents: contents.to_vec(),
            executable,
        }
    }

    #[test]
    fn identical_sets_match() {
        let a = [file("x", b"1", false), file("y", b"2", true)];
        let b = [file("x", b"1", false), file("y", b"2", true)];
        assert_eq!(Fingerprint::of_files(&a), Fingerprint::of_files(&b));
    }

    #[test]
    fn order_does_not_matter() {
        let a = [file("x", b"1", false), file("y", b"2", true)];
        let b = [file("y", b"2", true), file("x", b"1", false)];
        assert_eq!(Fingerprint::of_files(&a), Fingerprint::of_files(&b));
    }

    #[test]
    fn contents_matter() {
        let a = [file("x", b"1", false)];
        let b = [file("x", b"2", false)];
        assert_ne!(Fingerprint::of_files(&a), Fingerprint::of_files(&b));
    }

    #[test]
    fn executable_flag_matters() {
        let a = [file("x", b"1", false)];
        let b = [file("x", b"1", true)];
        assert_ne!(Fingerprint::of_files(&a), Fingerprint::of_files(&b));
    }

    #[test]
    fn entry_boundaries_are_unambiguous() {
        // Same concatenated bytes, different path/content split.
        let a = [file("ab", b"c", false)];
        let b = [file("a", b"bc", false)];
        assert_ne!(Fingerprint::of_files(&a), Fingerprint::of_files(&b));
    }

    #[test]
    fn empty_set_is_stable() {
        assert_eq!(Fingerprint::of_files(&[]), Fingerprint::of_files(&[]));
    }

    #[test]
    fn hex_roundtrip_via_bytes() {
        let fp = Fingerprint::of_files(&[file("x", b"1", false)]);
        let rebuilt = Fingerprint::from_bytes(*fp.as_bytes());
        assert_eq!(fp, rebuilt);
        assert_eq!(fp.to_hex().len(), 64);
    }
}
