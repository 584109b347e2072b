use crate::{
    app_info::{engine_version, AppInfo},
    device::MemoryProperties,
    Core,
};
use anyhow::{Context, Result};
use erupt::{cstr, vk, DeviceLoader, EntryLoader, InstanceLoader};
use std::ffi::{c_void, CString};
use std::{ffi::CStr, os::raw::c_char};
use tracing::info;

/// Build a windowless core with one queue capable of graphics, compute and transfers
pub fn build_core(info: AppInfo) -> Result<Core> {
    // Entry
    let entry = EntryLoader::new().context("Loading the Vulkan library")?;

    // Instance
    let app_name = CString::new(info.name)?;
    let engine_name = CString::new(crate::ENGINE_NAME)?;
    let app_info = vk::ApplicationInfoBuilder::new()
        .application_name(&app_name)
        .application_version(info.version)
        .engine_name(&engine_name)
        .engine_version(engine_version())
        .api_version(info.api_version);

    // Instance and device layers and extensions
    let mut instance_layers = Vec::new();
    let mut instance_extensions = vec![];
    let mut device_layers = Vec::new();
    let device_extensions = vec![];

    if info.validation {
        const LAYER_KHRONOS_VALIDATION: *const i8 = cstr!("VK_LAYER_KHRONOS_validation");
        instance_extensions
            .push(erupt::extensions::ext_debug_utils::EXT_DEBUG_UTILS_EXTENSION_NAME);
        instance_layers.push(LAYER_KHRONOS_VALIDATION);
        device_layers.push(LAYER_KHRONOS_VALIDATION);
    }

    // Instance creation
    let create_info = vk::InstanceCreateInfoBuilder::new()
        .application_info(&app_info)
        .enabled_extension_names(&instance_extensions)
        .enabled_layer_names(&instance_layers);

    let instance = InstanceLoader::new(&entry, &create_info, None)?;

    // Hardware selection
    let hardware = HeadlessHardwareSelection::query(&instance, &device_extensions)?;
    let device_name =
        unsafe { CStr::from_ptr(hardware.physical_device_properties.device_name.as_ptr()) };
    info!(device = ?device_name, queue_family = hardware.queue_family, "selected hardware");

    // Create logical device and queues
    let create_info = [vk::DeviceQueueCreateInfoBuilder::new()
        .queue_family_index(hardware.queue_family)
        .queue_priorities(&[1.0])];

    let physical_device_features = vk::PhysicalDeviceFeaturesBuilder::new();
    let mut features_12 = vk::PhysicalDeviceVulkan12FeaturesBuilder::new()
        .buffer_device_address(info.buffer_device_address);
    let mut create_info = vk::DeviceCreateInfoBuilder::new()
        .queue_create_infos(&create_info)
        .enabled_features(&physical_device_features)
        .enabled_extension_names(&device_extensions)
        .enabled_layer_names(&device_layers);
    if info.buffer_device_address {
        create_info.p_next =
            &mut *features_12 as *mut vk::PhysicalDeviceVulkan12Features as *const c_void;
    }

    let device = DeviceLoader::new(&instance, hardware.physical_device, &create_info, None)?;
    let queue = unsafe { device.get_device_queue(hardware.queue_family, 0, None) };

    let memory_properties = MemoryProperties::from(&unsafe {
        instance.get_physical_device_memory_properties(hardware.physical_device, None)
    });
    let max_memory_allocation_size = max_memory_allocation_size(
        &instance,
        &hardware,
        info.api_version,
        &memory_properties,
    );
    info!(max_memory_allocation_size, "memory limits");

    Ok(Core {
        physical_device: hardware.physical_device,
        device_properties: hardware.physical_device_properties,
        memory_properties,
        max_memory_allocation_size,
        queue_family: hardware.queue_family,
        queue,
        device,
        instance,
        entry,
    })
}

/// Read `maxMemoryAllocationSize` from the Maintenance3 properties. Vulkan 1.0 has no such
/// limit, so the largest heap stands in for it there.
fn max_memory_allocation_size(
    instance: &InstanceLoader,
    hardware: &HeadlessHardwareSelection,
    api_version: u32,
    memory_properties: &MemoryProperties,
) -> u64 {
    let version = api_version.min(hardware.physical_device_properties.api_version);
    if version < vk::make_version(1, 1, 0) {
        return memory_properties.largest_heap();
    }

    let mut maintenance_3 = vk::PhysicalDeviceMaintenance3PropertiesBuilder::new();
    let mut template = vk::PhysicalDeviceProperties2Builder::new();
    template.p_next =
        &mut *maintenance_3 as *mut vk::PhysicalDeviceMaintenance3Properties as *mut c_void;
    unsafe {
        instance.get_physical_device_properties2(hardware.physical_device, Some(template.build()));
    }

    match maintenance_3.max_memory_allocation_size {
        0 => memory_properties.largest_heap(),
        size => size,
    }
}

pub struct HeadlessHardwareSelection {
    pub physical_device: vk::PhysicalDevice,
    pub physical_device_properties: vk::PhysicalDeviceProperties,
    pub queue_family: u32,
}

impl HeadlessHardwareSelection {
    pub fn query(instance: &InstanceLoader, device_extensions: &[*const c_char]) -> Result<Self> {
        unsafe { instance.enumerate_physical_devices(None) }
            .result()?
            .into_iter()
            .filter_map(|physical_device| unsafe {
                let queue_family = instance
                    .get_physical_device_queue_family_properties(physical_device, None)
                    .into_iter()
                    .position(|properties| {
                        properties
                            .queue_flags
                            .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
                    })? as u32;

                let supported_extensions = instance
                    .enumerate_device_extension_properties(physical_device, None, None)
                    .result()
                    .ok()?;
                if !device_extensions.iter().all(|device_extension| {
                    let device_extension = CStr::from_ptr(*device_extension);

                    supported_extensions.iter().any(|properties| {
                        CStr::from_ptr(properties.extension_name.as_ptr()) == device_extension
                    })
                }) {
                    return None;
                }

                let physical_device_properties =
                    instance.get_physical_device_properties(physical_device, None);
                Some(Self {
                    physical_device,
                    queue_family,
                    physical_device_properties,
                })
            })
            .max_by_key(|query| match query.physical_device_properties.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 2,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
                _ => 0,
            })
            .ok_or_else(|| anyhow::format_err!("No suitable hardware found for this configuration"))
    }
}
