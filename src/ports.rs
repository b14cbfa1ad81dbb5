//! Enumeration of attached USB-serial ports.
//!
//! The filtering and ordering core is platform-free; vendor-ID discovery
//! reads sysfs on Linux. Ports whose vendor cannot be determined are
//! excluded.

/// Vendor IDs of known USB-serial bridges and microcontroller vendors.
pub const USB_SERIAL_VENDOR_IDS: [u16; 9] = [
    // Dedicated USB-serial bridges
    0x0403, // FTDI
    0x067B, // Prolific
    0x1A86, // WCH
    0x10C4, // Silicon Labs
    // Microcontroller / platform vendors
    0x16C0, // V-USB / PJRC
    0x2341, // Arduino
    0x2E8A, // Raspberry Pi
    0x0483, // STMicroelectronics
    0x04D8, // Microchip
];

/// A port the OS reports, with its USB vendor ID when determinable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCandidate {
    pub name: String,
    pub vendor_id: Option<u16>,
}

/// Attached ports whose USB vendor ID is in [`USB_SERIAL_VENDOR_IDS`],
/// naturally sorted so that a numeric suffix of 10 follows 9, not 1.
pub fn usb_serial_ports() -> Vec<String> {
    let mut names = filter_known_vendors(discover_candidates());
    sort_by_numeric_suffix(&mut names);
    names
}

pub(crate) fn filter_known_vendors(candidates: Vec<PortCandidate>) -> Vec<String> {
    candidates
        .into_iter()
        .filter(|c| c.vendor_id.is_some_and(|vid| USB_SERIAL_VENDOR_IDS.contains(&vid)))
        .map(|c| c.name)
        .collect()
}

/// Sorts by the first run of digits in the name, falling back to ordinal
/// order for ties and digit-less names.
pub(crate) fn sort_by_numeric_suffix(names: &mut [String]) {
    names.sort_by(|a, b| match (first_number(a), first_number(b)) {
        (Some(x), Some(y)) if x != y => x.cmp(&y),
        _ => a.as_str().cmp(b.as_str()),
    });
}

fn first_number(name: &str) -> Option<u64> {
    let digits: String = name
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

#[cfg(target_os = "linux")]
fn discover_candidates() -> Vec<PortCandidate> {
    let Ok(paths) = serial2::SerialPort::available_ports() else {
        return Vec::new();
    };
    paths
        .into_iter()
        .filter_map(|path| {
            let device = path.file_name()?.to_str()?.to_string();
            Some(PortCandidate {
                name: path.display().to_string(),
                vendor_id: sysfs_vendor_id(&device),
            })
        })
        .collect()
}

/// Walks up from the tty node to the USB interface's `idVendor`.
#[cfg(target_os = "linux")]
fn sysfs_vendor_id(device: &str) -> Option<u16> {
    for relative in ["device/../idVendor", "device/../../idVendor"] {
        let path = format!("/sys/class/tty/{device}/{relative}");
        if let Ok(contents) = std::fs::read_to_string(&path) {
            if let Ok(vid) = u16::from_str_radix(contents.trim(), 16) {
                return Some(vid);
            }
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn discover_candidates() -> Vec<PortCandidate> {
    // No portable vendor-ID source; the caller must name the port.
    Vec::new()
}
