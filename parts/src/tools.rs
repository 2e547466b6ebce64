// Opaque external collaborators: formatting and defragmentation are done by
// separate programs, not reimplemented here.

use std::process::Command;

use carve_core::CarveError;
use log::info;

/// Locate the mkfs-style tool for a filesystem type.
pub fn find_format_tool(fs_type: &str) -> Result<std::path::PathBuf, CarveError> {
    let tool = format!("mkfs.{}", fs_type.to_lowercase());
    which::which(&tool).map_err(|_| CarveError::ExternalToolMissing(tool))
}

/// Format a payload device with an external tool. Destructive; callers
/// confirm first and must have no pending table changes.
pub fn format(device_path: &str, fs_type: &str) -> Result<(), CarveError> {
    let tool = find_format_tool(fs_type)?;
    info!("Formatting {} as {} via {}", device_path, fs_type, tool.display());

    let status = Command::new(&tool).arg(device_path).status()?;
    if !status.success() {
        return Err(CarveError::Other(format!(
            "{} exited with {}",
            tool.display(),
            status
        )));
    }
    Ok(())
}

/// Defragment a payload device with an external tool.
pub fn defragment(device_path: &str, fs_type: &str) -> Result<(), CarveError> {
    let tool = match fs_type {
        "ext2" | "ext3" | "ext4" => "e4defrag",
        _ => {
            return Err(CarveError::Unsupported(format!(
                "No defragmenter for {}",
                fs_type
            )))
        }
    };
    let tool = which::which(tool).map_err(|_| CarveError::ExternalToolMissing(tool.to_string()))?;
    info!("Defragmenting {} via {}", device_path, tool.display());

    let status = Command::new(&tool).arg(device_path).status()?;
    if !status.success() {
        return Err(CarveError::Other(format!(
            "{} exited with {}",
            tool.display(),
            status
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_tool_reported() {
        match find_format_tool("no-such-filesystem-xyz") {
            Err(CarveError::ExternalToolMissing(name)) => {
                assert_eq!(name, "mkfs.no-such-filesystem-xyz")
            }
            other => panic!("expected missing tool, got {:?}", other),
        }
    }

    #[test]
    fn test_unsupported_defrag() {
        assert!(matches!(
            defragment("/dev/null", "ntfs"),
            Err(CarveError::Unsupported(_))
        ));
    }
}
