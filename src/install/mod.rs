//! Boot-time service management: `devmux install` / `devmux uninstall`.
//!
//! Renders a service definition with the resolved root/domain/port baked
//! in and registers it with systemd (Linux) or launchd (macOS). Run as
//! root on Linux this installs a system unit; otherwise a user unit.

use crate::config::Config;
use anyhow::Context;

#[cfg(target_os = "linux")]
const SERVICE_TEMPLATE: &str = include_str!("devmux.service.ini");
#[cfg(target_os = "macos")]
const SERVICE_TEMPLATE: &str = include_str!("com.devmux.plist.xml");
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
const SERVICE_TEMPLATE: &str = "";

pub const SERVICE_NAME: &str = "devmux";

/// Install the running binary as a boot-time service.
pub fn install(config: &Config) -> anyhow::Result<()> {
    let binary = std::env::current_exe().context("cannot locate own binary")?;
    let rendered = render_service(SERVICE_TEMPLATE, &binary.to_string_lossy(), config);
    platform::install(&rendered)?;
    println!(
        "Installed. Apps under {} are served at http://*.{}:{}",
        config.root.display(),
        config.domain,
        config.port
    );
    Ok(())
}

/// Stop and remove the boot-time service.
pub fn uninstall() -> anyhow::Result<()> {
    platform::uninstall()?;
    println!("Uninstalled.");
    Ok(())
}

fn render_service(template: &str, binary: &str, config: &Config) -> String {
    template
        .replace("{binary}", binary)
        .replace("{root}", &config.root.to_string_lossy())
        .replace("{domain}", &config.domain)
        .replace("{port}", &config.port.to_string())
}

#[cfg(target_os = "linux")]
mod platform {
    use super::SERVICE_NAME;
    use anyhow::{bail, Context};
    use std::path::PathBuf;
    use std::process::Command;

    fn is_superuser() -> bool {
        // Safety: geteuid has no preconditions and cannot fail.
        unsafe { libc::geteuid() == 0 }
    }

    fn unit_path() -> anyhow::Result<PathBuf> {
        if is_superuser() {
            Ok(PathBuf::from(format!(
                "/etc/systemd/system/{}.service",
                SERVICE_NAME
            )))
        } else {
            let home = std::env::var("HOME").context("HOME is not set")?;
            Ok(PathBuf::from(home)
                .join(".config/systemd/user")
                .join(format!("{}.service", SERVICE_NAME)))
        }
    }

    fn systemctl() -> Command {
        let mut cmd = Command::new("systemctl");
        if !is_superuser() {
            cmd.arg("--user");
        }
        cmd
    }

    fn run(mut cmd: Command) -> anyhow::Result<()> {
        let status = cmd.status().context("failed to run systemctl")?;
        if !status.success() {
            bail!("systemctl exited with {}", status);
        }
        Ok(())
    }

    pub fn install(unit: &str) -> anyhow::Result<()> {
        let path = unit_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(&path, unit)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("Wrote {}", path.display());

        run({
            let mut cmd = systemctl();
            cmd.arg("daemon-reload");
            cmd
        })?;
        run({
            let mut cmd = systemctl();
            cmd.args(["enable", "--now", SERVICE_NAME]);
            cmd
        })?;
        Ok(())
    }

    pub fn uninstall() -> anyhow::Result<()> {
        // Stop failures are fine; the unit may not be running.
        let _ = systemctl().args(["disable", "--now", SERVICE_NAME]).status();

        let path = unit_path()?;
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
        run({
            let mut cmd = systemctl();
            cmd.arg("daemon-reload");
            cmd
        })?;
        Ok(())
    }
}

#[cfg(target_os = "macos")]
mod platform {
    use anyhow::Context;
    use std::path::PathBuf;
    use std::process::Command;

    const LABEL: &str = "com.devmux";

    fn plist_path() -> anyhow::Result<PathBuf> {
        let home = std::env::var("HOME").context("HOME is not set")?;
        Ok(PathBuf::from(home)
            .join("Library/LaunchAgents")
            .join(format!("{}.plist", LABEL)))
    }

    pub fn install(plist: &str) -> anyhow::Result<()> {
        let path = plist_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(&path, plist)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("Wrote {}", path.display());

        let _ = Command::new("launchctl").arg("unload").arg(&path).status();
        let status = Command::new("launchctl")
            .arg("load")
            .arg(&path)
            .status()
            .context("failed to run launchctl")?;
        if !status.success() {
            anyhow::bail!("launchctl load exited with {}", status);
        }
        Ok(())
    }

    pub fn uninstall() -> anyhow::Result<()> {
        let path = plist_path()?;
        if path.exists() {
            let _ = Command::new("launchctl").arg("unload").arg(&path).status();
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
        Ok(())
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
mod platform {
    pub fn install(_unit: &str) -> anyhow::Result<()> {
        anyhow::bail!("service install is only supported on Linux (systemd) and macOS (launchd)")
    }

    pub fn uninstall() -> anyhow::Result<()> {
        anyhow::bail!("service install is only supported on Linux (systemd) and macOS (launchd)")
    }
}
