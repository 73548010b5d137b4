use crate::parcel::Parcel;
use crate::Error;

const STRICT_MODE_PENALTY_GATHER: i32 = 1 << 31;
/// The header marker, packed ["S", "Y", "S", "T"]
const HEADER: i32 = 0x53595354;
/// kUnsetWorkSource
const UNSET_WORK_SOURCE: i32 = -1;

/// The device-specific shape of the header that prefixes every request
/// payload: written in front of outbound requests, parsed off inbound
/// ones to recover the interface token.
pub trait RpcProtocol: Send + Sync {
    fn name(&self) -> &'static str;

    fn write_rpc_header(&self, parcel: &mut Parcel, iface: &str) -> Result<(), Error>;

    /// Parses the header at the start of `data`, yielding the interface
    /// token and the header length.
    fn extract_interface(&self, data: &[u8]) -> Option<(String, usize)>;
}

/// The /dev/binder framework dialect: strict-mode word, work-source
/// word, header marker, then the UTF-16 interface token.
struct AidlProtocol;

impl RpcProtocol for AidlProtocol {
    fn name(&self) -> &'static str {
        "aidl"
    }

    fn write_rpc_header(&self, parcel: &mut Parcel, iface: &str) -> Result<(), Error> {
        parcel.write_i32(STRICT_MODE_PENALTY_GATHER | 0x42000004)?;
        parcel.write_i32(UNSET_WORK_SOURCE)?;
        parcel.write_i32(HEADER)?;
        parcel.write_str16(iface)
    }

    fn extract_interface(&self, data: &[u8]) -> Option<(String, usize)> {
        let mut parcel = Parcel::from_slice(data);
        parcel.read_i32().ok()?;
        if parcel.read_i32().ok()? != UNSET_WORK_SOURCE {
            return None;
        }
        if parcel.read_i32().ok()? != HEADER {
            return None;
        }
        let iface = parcel.read_str16().ok()?;
        Some((iface, parcel.position() as usize))
    }
}

/// The /dev/hwbinder dialect: the fully-qualified interface name as a
/// bare NUL-terminated string.
struct HidlProtocol;

impl RpcProtocol for HidlProtocol {
    fn name(&self) -> &'static str {
        "hidl"
    }

    fn write_rpc_header(&self, parcel: &mut Parcel, iface: &str) -> Result<(), Error> {
        parcel.write_cstr8(iface)
    }

    fn extract_interface(&self, data: &[u8]) -> Option<(String, usize)> {
        let mut parcel = Parcel::from_slice(data);
        let iface = parcel.read_cstr8().ok()?;
        Some((iface, parcel.position() as usize))
    }
}

static AIDL: AidlProtocol = AidlProtocol;
static HIDL: HidlProtocol = HidlProtocol;

/// Picks the dialect for a device path; hwbinder speaks its own header
/// format, every other binder node speaks the framework one.
pub fn protocol_for_device(dev: &str) -> &'static dyn RpcProtocol {
    match dev.rsplit('/').next() {
        Some("hwbinder") => &HIDL,
        _ => &AIDL,
    }
}
