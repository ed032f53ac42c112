//! Interface enumeration via sysfs.

use std::io;
use std::path::Path;

/// Names of all network interfaces currently known to the kernel, sorted.
pub fn interface_names() -> io::Result<Vec<String>> {
    interface_names_in(Path::new("/sys/class/net"))
}

fn interface_names_in(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}
