//! Inline MicroPython snippets used to operate on the device over the REPL.
//!
//! File contents travel as hex so that arbitrary bytes survive the text
//! channel. Every snippet fits on one line except [`device_info`], which the
//! session wraps like any other multi-line source.

use crate::transfer::WriteMode;
use std::fmt::Write as _;

/// Raw bytes per REPL round trip (1000 hex characters).
pub const TEXT_CHUNK_SIZE: usize = 500;

/// Output of the online check.
pub const ONLINE_MARKER: &str = "done";

/// Quote `value` as a single-quoted Python string literal.
pub fn py_str(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(out, "\\x{:02x}", u32::from(c));
            },
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Escape multi-line source for a double-quoted `exec("...")` wrapper.
pub fn escape_source(source: &str) -> String {
    let mut out = String::with_capacity(source.len() + 16);
    for ch in source.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => {},
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

/// Print `done`; a device that answers is online.
pub fn online_check() -> String {
    format!("print({})", py_str(ONLINE_MARKER))
}

/// Write one hex-encoded chunk to `path`.
pub fn write_chunk(path: &str, chunk: &[u8], mode: WriteMode) -> String {
    let file_mode = match mode {
        WriteMode::Truncate => "wb",
        WriteMode::Append => "ab",
    };
    format!(
        "import ubinascii;f=open({},{});f.write(ubinascii.unhexlify({}));f.close()",
        py_str(path),
        py_str(file_mode),
        py_str(&hex::encode(chunk)),
    )
}

/// Print `len` bytes of `path` starting at `offset`, hex-encoded.
pub fn read_chunk(path: &str, offset: usize, len: usize) -> String {
    format!(
        "import ubinascii;f=open({},'rb');f.seek({offset});print(ubinascii.hexlify(f.read({len})).decode());f.close()",
        py_str(path),
    )
}

/// Print the names in a directory as a Python list.
pub fn list_dir(path: &str) -> String {
    format!("import os;print(os.listdir({}))", py_str(path))
}

/// Remove a file.
pub fn remove_file(path: &str) -> String {
    format!("import os;os.remove({})", py_str(path))
}

/// Run a file that already exists on the device.
pub fn execute_file(path: &str) -> String {
    format!("exec(open({}).read())", py_str(path))
}

/// Connect the station interface to a network.
pub fn set_wifi(ssid: &str, password: &str) -> String {
    format!(
        "import network;w=network.WLAN(network.STA_IF);w.active(True);w.connect({},{})",
        py_str(ssid),
        py_str(password),
    )
}

/// Print device facts as `key=value` lines.
pub fn device_info() -> String {
    [
        "import sys, os, gc, machine, ubinascii",
        "print('platform=' + sys.platform)",
        "print('version=' + sys.version)",
        "print('chip_id=' + ubinascii.hexlify(machine.unique_id()).decode())",
        "s = os.statvfs('/')",
        "print('flash_size=%d' % (s[0] * s[2]))",
        "print('ram_size=%d' % (gc.mem_free() + gc.mem_alloc()))",
        "try:",
        "    import network",
        "    print('mac_address=' + ubinascii.hexlify(network.WLAN(network.STA_IF).config('mac'), ':').decode())",
        "except Exception:",
        "    pass",
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_py_str_escapes() {
        assert_eq!(py_str("/flash/main.py"), "'/flash/main.py'");
        assert_eq!(py_str("it's"), "'it\\'s'");
        assert_eq!(py_str("a\\b"), "'a\\\\b'");
        assert_eq!(py_str("x\ny"), "'x\\ny'");
        assert_eq!(py_str("\u{1}"), "'\\x01'");
    }

    #[test]
    fn test_escape_source() {
        assert_eq!(
            escape_source("for i in range(2):\r\n    print(\"hi\")\n"),
            "for i in range(2):\\n    print(\\\"hi\\\")\\n"
        );
    }

    #[test]
    fn test_write_chunk_modes() {
        let first = write_chunk("/x.py", b"pr", WriteMode::Truncate);
        assert_eq!(
            first,
            "import ubinascii;f=open('/x.py','wb');f.write(ubinascii.unhexlify('7072'));f.close()"
        );
        let next = write_chunk("/x.py", b"pr", WriteMode::Append);
        assert!(next.contains("open('/x.py','ab')"));
    }

    #[test]
    fn test_write_chunk_fits_budget() {
        let script = write_chunk("/flash/main.py", &[0xFF; TEXT_CHUNK_SIZE], WriteMode::Append);
        assert!(!script.contains('\n'));
        assert!(script.len() < TEXT_CHUNK_SIZE * 2 + 120);
    }

    #[test]
    fn test_read_chunk() {
        assert_eq!(
            read_chunk("/x.py", 500, 500),
            "import ubinascii;f=open('/x.py','rb');f.seek(500);print(ubinascii.hexlify(f.read(500)).decode());f.close()"
        );
    }

    #[test]
    fn test_simple_scripts() {
        assert_eq!(online_check(), "print('done')");
        assert_eq!(list_dir("/"), "import os;print(os.listdir('/'))");
        assert_eq!(remove_file("/x.py"), "import os;os.remove('/x.py')");
        assert_eq!(execute_file("/x.py"), "exec(open('/x.py').read())");
        assert!(set_wifi("home", "p'w").contains("w.connect('home','p\\'w')"));
    }

    #[test]
    fn test_device_info_is_multiline() {
        let script = device_info();
        assert!(script.lines().count() > 1);
        assert!(script.contains("platform="));
        assert!(script.contains("mac_address="));
    }
}
