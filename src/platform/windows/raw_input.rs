//! Keyboard and mouse discovery through the Raw Input device list.

use std::ffi::c_void;
use windows::Win32::Devices::DeviceAndDriverInstallation::{
    CM_Get_DevNode_PropertyW, CM_Get_Device_Interface_PropertyW, CM_LOCATE_DEVNODE_NORMAL,
    CM_Locate_DevNodeW, CR_SUCCESS,
};
use windows::Win32::Devices::Properties::DEVPROPTYPE;
use windows::Win32::Foundation::{DEVPROPKEY, HANDLE};
use windows::Win32::UI::Input::{
    GetRawInputDeviceInfoW, GetRawInputDeviceList, RAWINPUTDEVICELIST, RIDI_DEVICENAME,
    RIM_TYPEKEYBOARD, RIM_TYPEMOUSE,
};
use windows::core::{GUID, PCWSTR};

const DEVPKEY_NAME: DEVPROPKEY = DEVPROPKEY {
    fmtid: GUID::from_u128(0xb725f130_47ef_101a_a5f1_02608c9eebac),
    pid: 10,
};
const DEVPKEY_DEVICE_INSTANCE_ID: DEVPROPKEY = DEVPROPKEY {
    fmtid: GUID::from_u128(0x78c34fc8_104a_4aca_9ea4_524d52996e57),
    pid: 256,
};
const DEVPKEY_DEVICE_HARDWARE_IDS: DEVPROPKEY = DEVPROPKEY {
    fmtid: GUID::from_u128(0xa45c254e_df1c_4efd_8020_67d146a850e0),
    pid: 3,
};

/// One keyboard or mouse known to Raw Input.
#[derive(Debug, Clone)]
pub struct RawDevice {
    /// Raw Input handle value.
    pub handle: isize,
    /// Display name.
    pub name: String,
    /// Device instance id, used as the stable id.
    pub instance_id: String,
    /// NUL-separated hardware ids.
    pub hardware_ids: String,
}

fn from_wide(buffer: &[u16]) -> String {
    let end = buffer.iter().position(|c| *c == 0).unwrap_or(buffer.len());
    String::from_utf16_lossy(&buffer[..end])
}

fn from_multi_wide(buffer: &[u16]) -> String {
    String::from_utf16_lossy(buffer)
        .trim_end_matches('\0')
        .to_string()
}

/// Handles of all attached keyboards and mice.
pub fn device_handles() -> Vec<isize> {
    let entry_size = size_of::<RAWINPUTDEVICELIST>() as u32;
    let mut count = 0u32;
    if unsafe { GetRawInputDeviceList(None, &mut count, entry_size) } == u32::MAX {
        return Vec::new();
    }
    let mut list = vec![RAWINPUTDEVICELIST::default(); count as usize];
    let read = unsafe { GetRawInputDeviceList(Some(list.as_mut_ptr()), &mut count, entry_size) };
    if read == u32::MAX {
        return Vec::new();
    }
    list.truncate(read as usize);
    list.iter()
        .filter(|entry| entry.dwType == RIM_TYPEKEYBOARD || entry.dwType == RIM_TYPEMOUSE)
        .map(|entry| entry.hDevice.0 as isize)
        .collect()
}

fn interface_name(handle: isize) -> Option<Vec<u16>> {
    let handle = HANDLE(handle as *mut c_void);
    let mut size = 0u32;
    unsafe { GetRawInputDeviceInfoW(Some(handle), RIDI_DEVICENAME, None, &mut size) };
    if size == 0 {
        return None;
    }
    let mut name = vec![0u16; size as usize + 1];
    let read = unsafe {
        GetRawInputDeviceInfoW(
            Some(handle),
            RIDI_DEVICENAME,
            Some(name.as_mut_ptr().cast()),
            &mut size,
        )
    };
    (read != u32::MAX && read > 0).then_some(name)
}

fn interface_property(interface: &[u16], key: &DEVPROPKEY) -> Option<Vec<u16>> {
    let mut property_type = DEVPROPTYPE::default();
    let mut size = 0u32;
    unsafe {
        let _ = CM_Get_Device_Interface_PropertyW(
            PCWSTR(interface.as_ptr()),
            key,
            &mut property_type,
            None,
            &mut size,
            0,
        );
    }
    let mut buffer = vec![0u16; (size as usize).div_ceil(2)];
    let result = unsafe {
        CM_Get_Device_Interface_PropertyW(
            PCWSTR(interface.as_ptr()),
            key,
            &mut property_type,
            Some(buffer.as_mut_ptr().cast()),
            &mut size,
            0,
        )
    };
    (result == CR_SUCCESS).then_some(buffer)
}

fn node_property(node: u32, key: &DEVPROPKEY) -> Option<Vec<u16>> {
    let mut property_type = DEVPROPTYPE::default();
    let mut size = 0u32;
    unsafe {
        let _ = CM_Get_DevNode_PropertyW(node, key, &mut property_type, None, &mut size, 0);
    }
    let mut buffer = vec![0u16; (size as usize).div_ceil(2)];
    let result = unsafe {
        CM_Get_DevNode_PropertyW(
            node,
            key,
            &mut property_type,
            Some(buffer.as_mut_ptr().cast()),
            &mut size,
            0,
        )
    };
    (result == CR_SUCCESS).then_some(buffer)
}

/// Name, instance id and hardware ids of a device.
pub fn describe(handle: isize) -> Option<RawDevice> {
    let interface = interface_name(handle)?;
    let instance_id = interface_property(&interface, &DEVPKEY_DEVICE_INSTANCE_ID)?;

    let mut node = 0u32;
    let located = unsafe {
        CM_Locate_DevNodeW(&mut node, PCWSTR(instance_id.as_ptr()), CM_LOCATE_DEVNODE_NORMAL)
    };
    if located != CR_SUCCESS {
        return None;
    }

    let name = node_property(node, &DEVPKEY_NAME)
        .map(|b| from_wide(&b))
        .unwrap_or_default();
    let hardware_ids = node_property(node, &DEVPKEY_DEVICE_HARDWARE_IDS)
        .map(|b| from_multi_wide(&b))
        .unwrap_or_default();

    Some(RawDevice {
        handle,
        name,
        instance_id: from_wide(&instance_id),
        hardware_ids,
    })
}
