//! Emulator command-line construction.
//!
//! [`build_args`] is a pure function from a [`LaunchSpec`] to the argument
//! vector; nothing here touches the process table.

use crate::config::{ImageKind, QvmdConfig};
use qvmd_protocol::ports;
use std::path::{Path, PathBuf};

/// Device node whose presence enables hardware acceleration.
pub const KVM_DEVICE: &str = "/dev/kvm";

/// Video memory sizes the cirrus adapter accepts, in MiB.
pub const CIRRUS_VGAMEM_MB: [u32; 3] = [4, 8, 16];

/// Check if the host exposes KVM.
pub fn kvm_available() -> bool {
    Path::new(KVM_DEVICE).exists()
}

/// Everything needed to build one emulator invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Disk or optical image.
    pub image_path: PathBuf,
    /// How the image is attached and booted.
    pub image_kind: ImageKind,
    /// Guest memory in MiB.
    pub ram_mb: u32,
    /// Video memory in MiB.
    pub vram_mb: u32,
    /// QMP port on the loopback interface.
    pub qmp_port: u16,
    /// VNC display number.
    pub vnc_display: u16,
    /// Add `-enable-kvm`.
    pub acceleration: bool,
    /// Attach a user-mode NIC.
    pub network: bool,
    /// Inbound migration stream to load on start.
    pub incoming: Option<PathBuf>,
}

impl LaunchSpec {
    /// Create a spec with default ports and no acceleration.
    pub fn new(
        image_path: impl Into<PathBuf>,
        image_kind: ImageKind,
        ram_mb: u32,
        vram_mb: u32,
    ) -> Self {
        Self {
            image_path: image_path.into(),
            image_kind,
            ram_mb,
            vram_mb,
            qmp_port: ports::QMP,
            vnc_display: 0,
            acceleration: false,
            network: true,
            incoming: None,
        }
    }

    /// Take ports and the network flag from the service configuration.
    pub fn with_config(mut self, config: &QvmdConfig) -> Self {
        self.qmp_port = config.qmp_port;
        self.vnc_display = config.vnc_display;
        self.network = config.network;
        self
    }

    /// Set hardware acceleration.
    pub fn with_acceleration(mut self, acceleration: bool) -> Self {
        self.acceleration = acceleration;
        self
    }

    /// Load state from a snapshot file on start.
    pub fn with_incoming(mut self, snapshot: impl Into<PathBuf>) -> Self {
        self.incoming = Some(snapshot.into());
        self
    }
}

/// Build the emulator argument vector.
pub fn build_args(spec: &LaunchSpec) -> Vec<String> {
    let mut args: Vec<String> = Vec::with_capacity(48);

    if spec.acceleration {
        args.push("-enable-kvm".into());
    }

    // Single simple vCPU and instruction-count throttling cap host CPU use
    push(&mut args, "-m", format!("{}M", spec.ram_mb));
    push(&mut args, "-smp", "1");
    push(&mut args, "-cpu", "qemu64");
    push(&mut args, "-icount", "shift=auto,sleep=on");
    push(&mut args, "-rtc", "base=utc,clock=vm");

    push(&mut args, "-vnc", format!("127.0.0.1:{}", spec.vnc_display));
    push(&mut args, "-device", "usb-ehci");
    push(&mut args, "-device", "usb-tablet");
    push(&mut args, "-vga", "cirrus");
    // Any other size fails device realize; leave the adapter at its default
    if CIRRUS_VGAMEM_MB.contains(&spec.vram_mb) {
        push(
            &mut args,
            "-global",
            format!("cirrus-vga.vgamem_mb={}", spec.vram_mb),
        );
    }
    push(
        &mut args,
        "-qmp",
        format!("tcp:127.0.0.1:{},server,nowait", spec.qmp_port),
    );

    if let Some(snapshot) = &spec.incoming {
        push(&mut args, "-incoming", incoming_uri(snapshot));
    }

    match spec.image_kind {
        ImageKind::Optical => {
            push(&mut args, "-cdrom", spec.image_path.display().to_string());
            push(&mut args, "-boot", "d");
        }
        ImageKind::Disk | ImageKind::Unknown => {
            push(
                &mut args,
                "-drive",
                format!(
                    "file={},format=raw,if=ide,index=0,media=disk",
                    escape_opt_value(&spec.image_path.display().to_string())
                ),
            );
            push(&mut args, "-boot", "c");
        }
    }

    if spec.network {
        push(&mut args, "-net", "nic,model=e1000");
        push(&mut args, "-net", "user");
    }

    args
}

/// Migration URI that streams state into a snapshot file.
pub fn outgoing_uri(snapshot: &Path) -> String {
    format!("exec:cat > {}", shell_quote(&snapshot.display().to_string()))
}

/// Migration URI that streams state out of a snapshot file.
pub fn incoming_uri(snapshot: &Path) -> String {
    format!("exec:cat {}", shell_quote(&snapshot.display().to_string()))
}

fn push(args: &mut Vec<String>, flag: &str, value: impl Into<String>) {
    args.push(flag.to_string());
    args.push(value.into());
}

/// Quote a string for `/bin/sh`, which runs `exec:` migration URIs.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Escape a value inside a comma-separated option list.
fn escape_opt_value(s: &str) -> String {
    s.replace(',', ",,")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value_of<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].as_str())
            .collect()
    }

    #[test]
    fn test_optical_selects_cdrom_boot_for_any_memory_size() {
        for (ram, vram) in [(64, 1), (512, 16), (2048, 64), (16384, 256)] {
            let args = build_args(&LaunchSpec::new("/x/setup.iso", ImageKind::Optical, ram, vram));
            assert_eq!(value_of(&args, "-cdrom"), vec!["/x/setup.iso"]);
            assert_eq!(value_of(&args, "-boot"), vec!["d"]);
            assert!(value_of(&args, "-drive").is_empty());
        }
    }

    #[test]
    fn test_non_optical_selects_disk_boot_for_any_memory_size() {
        for kind in [ImageKind::Disk, ImageKind::Unknown] {
            for (ram, vram) in [(64, 1), (2048, 16), (16384, 256)] {
                let args = build_args(&LaunchSpec::new("/x/flex.bin", kind, ram, vram));
                assert_eq!(
                    value_of(&args, "-drive"),
                    vec!["file=/x/flex.bin,format=raw,if=ide,index=0,media=disk"]
                );
                assert_eq!(value_of(&args, "-boot"), vec!["c"]);
                assert!(value_of(&args, "-cdrom").is_empty());
            }
        }
    }

    #[test]
    fn test_fixed_arguments() {
        let args = build_args(&LaunchSpec::new("/x/flex.bin", ImageKind::Disk, 2048, 16));

        assert_eq!(value_of(&args, "-m"), vec!["2048M"]);
        assert_eq!(value_of(&args, "-smp"), vec!["1"]);
        assert_eq!(value_of(&args, "-icount"), vec!["shift=auto,sleep=on"]);
        assert_eq!(value_of(&args, "-rtc"), vec!["base=utc,clock=vm"]);
        assert_eq!(value_of(&args, "-vnc"), vec!["127.0.0.1:0"]);
        assert_eq!(value_of(&args, "-device"), vec!["usb-ehci", "usb-tablet"]);
        assert_eq!(value_of(&args, "-vga"), vec!["cirrus"]);
        assert_eq!(value_of(&args, "-global"), vec!["cirrus-vga.vgamem_mb=16"]);
        assert_eq!(
            value_of(&args, "-qmp"),
            vec!["tcp:127.0.0.1:4444,server,nowait"]
        );
        assert_eq!(value_of(&args, "-net"), vec!["nic,model=e1000", "user"]);
    }

    #[test]
    fn test_vram_outside_cirrus_sizes_uses_adapter_default() {
        for vram in CIRRUS_VGAMEM_MB {
            let args = build_args(&LaunchSpec::new("/x/flex.bin", ImageKind::Disk, 512, vram));
            assert_eq!(
                value_of(&args, "-global"),
                vec![format!("cirrus-vga.vgamem_mb={}", vram)]
            );
        }

        for vram in [1, 32, 64, 128] {
            let args = build_args(&LaunchSpec::new("/x/flex.bin", ImageKind::Disk, 512, vram));
            assert!(value_of(&args, "-global").is_empty(), "vram={}", vram);
            assert_eq!(value_of(&args, "-vga"), vec!["cirrus"]);
        }
    }

    #[test]
    fn test_acceleration_flag_only_when_requested() {
        let spec = LaunchSpec::new("/x/flex.bin", ImageKind::Disk, 512, 16);
        assert!(!build_args(&spec).iter().any(|a| a == "-enable-kvm"));

        let args = build_args(&spec.with_acceleration(true));
        assert_eq!(args[0], "-enable-kvm");
    }

    #[test]
    fn test_incoming_snapshot_is_added_to_same_vector() {
        let spec = LaunchSpec::new("/x/flex.bin", ImageKind::Disk, 512, 16);
        let plain = build_args(&spec);
        let restored = build_args(&spec.clone().with_incoming("/snaps/snapshot_1.state"));

        assert_eq!(
            value_of(&restored, "-incoming"),
            vec!["exec:cat '/snaps/snapshot_1.state'"]
        );
        let without: Vec<_> = restored
            .iter()
            .filter(|a| *a != "-incoming" && !a.starts_with("exec:"))
            .cloned()
            .collect();
        assert_eq!(without, plain);
    }

    #[test]
    fn test_configured_ports_and_network() {
        let config = QvmdConfig {
            qmp_port: 4555,
            vnc_display: 3,
            network: false,
            ..Default::default()
        };
        let args =
            build_args(&LaunchSpec::new("/x/a.img", ImageKind::Disk, 512, 16).with_config(&config));
        assert_eq!(value_of(&args, "-qmp"), vec!["tcp:127.0.0.1:4555,server,nowait"]);
        assert_eq!(value_of(&args, "-vnc"), vec!["127.0.0.1:3"]);
        assert!(value_of(&args, "-net").is_empty());
    }

    #[test]
    fn test_path_escaping() {
        let args = build_args(&LaunchSpec::new("/x/a,b.img", ImageKind::Disk, 512, 16));
        assert!(value_of(&args, "-drive")[0].starts_with("file=/x/a,,b.img,"));

        assert_eq!(
            outgoing_uri(Path::new("/snaps/it's.state")),
            r"exec:cat > '/snaps/it'\''s.state'"
        );
    }
}
