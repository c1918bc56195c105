//! Argument vector marshaling for the start call.
//!
//! All arguments live in one contiguous buffer, each followed by a NUL
//! terminator, with a separate table of start offsets. An argument that
//! already contains a NUL is cut off there.

use std::ffi::{CStr, c_char};

/// Contiguous, NUL-terminated argument storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgVector {
    buffer: Vec<u8>,
    offsets: Vec<usize>,
}

impl ArgVector {
    /// Copy `args` into a single buffer.
    pub fn marshal<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut buffer = Vec::new();
        let mut offsets = Vec::new();

        for arg in args {
            let bytes = arg.as_ref().as_bytes();
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());

            offsets.push(buffer.len());
            buffer.extend_from_slice(&bytes[..end]);
            buffer.push(0);
        }

        Self { buffer, offsets }
    }

    pub fn argc(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// The raw buffer, terminators included.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn get(&self, index: usize) -> Option<&CStr> {
        let start = *self.offsets.get(index)?;
        CStr::from_bytes_until_nul(&self.buffer[start..]).ok()
    }

    /// Argument `index` as text.
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.get(index).and_then(|arg| arg.to_str().ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> + '_ {
        (0..self.argc()).filter_map(|index| self.arg(index))
    }

    /// Pointers into the buffer, one per argument, in argument-vector form.
    ///
    /// The pointers are valid only while `self` is alive and unmodified.
    pub fn argv(&self) -> Vec<*const c_char> {
        self.offsets
            .iter()
            .map(|&offset| self.buffer[offset..].as_ptr().cast::<c_char>())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_layout() {
        let args = ArgVector::marshal(["node", "main.js", ""]);

        assert_eq!(args.argc(), 3);
        assert_eq!(args.buffer(), b"node\0main.js\0\0");
        assert_eq!(args.offsets(), &[0, 5, 13]);
        assert_eq!(args.arg(0), Some("node"));
        assert_eq!(args.arg(1), Some("main.js"));
        assert_eq!(args.arg(2), Some(""));
        assert_eq!(args.arg(3), None);
    }

    #[test]
    fn test_embedded_terminator_truncates() {
        let args = ArgVector::marshal(["ab\0cd", "ef"]);

        assert_eq!(args.buffer(), b"ab\0ef\0");
        assert_eq!(args.iter().collect::<Vec<_>>(), vec!["ab", "ef"]);
    }

    #[test]
    fn test_argv_points_into_buffer() {
        let args = ArgVector::marshal(vec!["one".to_string(), "two".to_string()]);
        let argv = args.argv();

        assert_eq!(argv.len(), 2);
        let base = args.buffer().as_ptr() as usize;
        assert_eq!(argv[0] as usize - base, 0);
        assert_eq!(argv[1] as usize - base, 4);
    }

    #[test]
    fn test_empty() {
        let args = ArgVector::marshal(Vec::<String>::new());
        assert!(args.is_empty());
        assert!(args.argv().is_empty());
        assert!(args.buffer().is_empty());
    }
}
