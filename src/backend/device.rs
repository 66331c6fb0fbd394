// Vulkan Context - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Physical device selection (required extensions, GCT queue, prefer discrete GPU)
// - Feature query + logical device creation with the requested extensions
// - Reporting which ray tracing features ended up enabled

use anyhow::{Context, Result};
use ash::{vk, Entry};
use std::ffi::{CStr, CString};
use std::sync::Arc;

use super::extensions::{missing_extensions, ContextCreateInfo, FeatureRequest};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Queue capabilities of the single queue this context uses
const GCT_QUEUE_FLAGS: vk::QueueFlags = vk::QueueFlags::from_raw(
    vk::QueueFlags::GRAPHICS.as_raw()
        | vk::QueueFlags::COMPUTE.as_raw()
        | vk::QueueFlags::TRANSFER.as_raw(),
);

/// Feature flags read back from the device during creation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnabledFeatures {
    pub acceleration_structure: bool,
    pub ray_query: bool,
    pub buffer_device_address: bool,
}

impl EnabledFeatures {
    /// Acceleration structures and ray queries must both be on
    pub fn require_ray_tracing(&self) -> Result<()> {
        if !self.acceleration_structure {
            anyhow::bail!("Device does not support acceleration structures");
        }
        if !self.ray_query {
            anyhow::bail!("Device does not support ray queries");
        }
        Ok(())
    }
}

/// Vulkan context wrapper with automatic cleanup
pub struct VulkanContext {
    // Vulkan handles (destroyed in Drop, reverse order of creation)
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    // Graphics + compute + transfer queue
    pub queue_gct: vk::Queue,
    pub queue_gct_family: u32,

    // Debug utils (if validation enabled)
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    pub features: EnabledFeatures,
    pub enabled_extensions: Vec<&'static CStr>,
}

/// A physical device as seen during selection
#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    pub physical_device: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub gct_queue_family: Option<u32>,
    pub missing_extensions: Vec<&'static CStr>,
}

impl DeviceCandidate {
    pub fn is_compatible(&self, min_api_version: u32) -> bool {
        self.api_version >= min_api_version
            && self.gct_queue_family.is_some()
            && self.missing_extensions.is_empty()
    }
}

impl VulkanContext {
    /// Create the instance, pick a GPU and create the logical device
    pub fn new(info: &ContextCreateInfo) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan context: {}", info.app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Create instance
        let enable_validation = info.validation && Self::validation_layer_available(&entry);
        let mut info = info.clone();
        if enable_validation {
            info.add_instance_extension(ash::extensions::ext::DebugUtils::name());
        }
        let instance = Self::create_instance(&entry, &info, enable_validation)?;

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        // Step 4: Pick physical device (GPU)
        let candidate = Self::pick_physical_device(&instance, &info)?;
        let physical_device = candidate.physical_device;
        let queue_gct_family = candidate
            .gct_queue_family
            .context("Selected GPU has no graphics/compute/transfer queue")?;

        // Step 5: Create logical device, reading back feature support
        let enabled_extensions = Self::enabled_extensions(&instance, physical_device, &info)?;
        let (device, features) = Self::create_logical_device(
            &instance,
            physical_device,
            queue_gct_family,
            &enabled_extensions,
            &info,
        )?;
        let queue_gct = unsafe { device.get_device_queue(queue_gct_family, 0) };

        // Step 6: Cache device properties
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

        log::info!("Selected GPU: {}", candidate.name);
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::debug!("Enabled features: {:?}", features);

        Ok(Arc::new(Self {
            device,
            physical_device,
            instance,
            _entry: entry,
            queue_gct,
            queue_gct_family,
            debug_utils,
            properties,
            features,
            enabled_extensions,
        }))
    }

    pub fn device_name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    fn validation_layer_available(entry: &Entry) -> bool {
        let layers = match entry.enumerate_instance_layer_properties() {
            Ok(layers) => layers,
            Err(e) => {
                log::warn!("Failed to enumerate instance layers: {}", e);
                return false;
            }
        };

        let found = layers.iter().any(|layer| {
            let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
            name == VALIDATION_LAYER
        });
        if !found {
            log::warn!("Validation layer not installed, continuing without it");
        }
        found
    }

    fn create_instance(
        entry: &Entry,
        info: &ContextCreateInfo,
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(info.app_name.as_str())?;
        let engine_name = CString::new("vk-fill")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(info.api_version);

        let extensions: Vec<_> = info
            .instance_extensions
            .iter()
            .map(|name| name.as_ptr())
            .collect();

        // Validation layers
        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        info: &ContextCreateInfo,
    ) -> Result<DeviceCandidate> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        let required = info.required_device_extensions();
        let mut candidates = Vec::with_capacity(devices.len());

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };
            let available = unsafe { instance.enumerate_device_extension_properties(device) }
                .context("Failed to query device extensions")?;

            let candidate = DeviceCandidate {
                physical_device: device,
                name: unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
                    .to_string_lossy()
                    .into_owned(),
                device_type: props.device_type,
                api_version: props.api_version,
                gct_queue_family: find_gct_queue_family(&queue_families),
                missing_extensions: missing_extensions(&required, &available),
            };

            if !candidate.missing_extensions.is_empty() {
                log::debug!(
                    "Skipping {}: missing {:?}",
                    candidate.name,
                    candidate.missing_extensions
                );
            }
            candidates.push(candidate);
        }

        select_device(candidates, info.api_version, info.device_index)
    }

    /// Required extensions plus whichever optional ones the GPU has
    fn enabled_extensions(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        info: &ContextCreateInfo,
    ) -> Result<Vec<&'static CStr>> {
        let optional = info.optional_device_extensions();
        let mut enabled = info.required_device_extensions();

        if !optional.is_empty() {
            let available =
                unsafe { instance.enumerate_device_extension_properties(physical_device) }
                    .context("Failed to query device extensions")?;
            let missing = missing_extensions(&optional, &available);
            for name in optional {
                if missing.contains(&name) {
                    log::info!("Optional extension {:?} not supported", name);
                } else {
                    enabled.push(name);
                }
            }
        }

        Ok(enabled)
    }

    /// Creates the device with every supported feature of the chained structs
    /// turned on, and reports the ray tracing related ones.
    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
        extension_names: &[&'static CStr],
        info: &ContextCreateInfo,
    ) -> Result<(ash::Device, EnabledFeatures)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let extensions: Vec<_> = extension_names.iter().map(|name| name.as_ptr()).collect();

        let mut vulkan11 = vk::PhysicalDeviceVulkan11Features::default();
        let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut acceleration_structure =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut ray_query = vk::PhysicalDeviceRayQueryFeaturesKHR::default();

        let device = {
            let mut features2 = vk::PhysicalDeviceFeatures2::builder()
                .push_next(&mut vulkan11)
                .push_next(&mut vulkan12);
            if info.requests(FeatureRequest::AccelerationStructure) {
                features2 = features2.push_next(&mut acceleration_structure);
            }
            if info.requests(FeatureRequest::RayQuery) {
                features2 = features2.push_next(&mut ray_query);
            }

            // Fills every struct in the chain with what the GPU supports
            unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };

            let create_info = vk::DeviceCreateInfo::builder()
                .queue_create_infos(std::slice::from_ref(&queue_create_info))
                .enabled_extension_names(&extensions)
                .push_next(&mut features2);

            unsafe { instance.create_device(physical_device, &create_info, None) }
                .context("Failed to create logical device")?
        };

        let features = EnabledFeatures {
            acceleration_structure: acceleration_structure.acceleration_structure == vk::TRUE,
            ray_query: ray_query.ray_query == vk::TRUE,
            buffer_device_address: vulkan12.buffer_device_address == vk::TRUE,
        };

        Ok((device, features))
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan context...");

        // Wait for device to finish
        let _ = self.wait_idle();

        // Cleanup in reverse order
        unsafe {
            self.device.destroy_device(None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// First queue family that can do graphics, compute and transfer
pub fn find_gct_queue_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    families
        .iter()
        .position(|props| props.queue_count > 0 && props.queue_flags.contains(GCT_QUEUE_FLAGS))
        .map(|i| i as u32)
}

/// Prefer discrete GPUs
pub fn device_type_score(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 10,
        _ => 1,
    }
}

/// Keep compatible candidates, then take `device_index` among them or the
/// best scoring one. Ties go to the earliest enumerated device.
pub fn select_device(
    candidates: Vec<DeviceCandidate>,
    min_api_version: u32,
    device_index: Option<usize>,
) -> Result<DeviceCandidate> {
    let mut compatible: Vec<_> = candidates
        .into_iter()
        .filter(|candidate| candidate.is_compatible(min_api_version))
        .collect();

    if compatible.is_empty() {
        anyhow::bail!("No GPU supports the requested API version, queues and extensions");
    }

    if let Some(index) = device_index {
        if index >= compatible.len() {
            anyhow::bail!(
                "device_index {} out of range ({} compatible GPUs)",
                index,
                compatible.len()
            );
        }
        return Ok(compatible.swap_remove(index));
    }

    let mut best = 0;
    for (i, candidate) in compatible.iter().enumerate() {
        if device_type_score(candidate.device_type)
            > device_type_score(compatible[best].device_type)
        {
            best = i;
        }
    }
    Ok(compatible.swap_remove(best))
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn candidate(name: &str, device_type: vk::PhysicalDeviceType) -> DeviceCandidate {
        DeviceCandidate {
            physical_device: vk::PhysicalDevice::null(),
            name: name.to_string(),
            device_type,
            api_version: vk::API_VERSION_1_3,
            gct_queue_family: Some(0),
            missing_extensions: Vec::new(),
        }
    }

    #[test]
    fn missing_ray_query_trips_precondition() {
        let features = EnabledFeatures {
            acceleration_structure: true,
            ray_query: false,
            buffer_device_address: true,
        };
        let err = features.require_ray_tracing().unwrap_err();
        assert!(err.to_string().contains("ray queries"));
    }

    #[test]
    fn missing_acceleration_structure_trips_precondition() {
        let features = EnabledFeatures {
            ray_query: true,
            ..Default::default()
        };
        let err = features.require_ray_tracing().unwrap_err();
        assert!(err.to_string().contains("acceleration structures"));
    }

    #[test]
    fn both_features_pass_precondition() {
        let features = EnabledFeatures {
            acceleration_structure: true,
            ray_query: true,
            buffer_device_address: false,
        };
        assert!(features.require_ray_tracing().is_ok());
    }

    #[test]
    fn gct_family_skips_partial_families() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(GCT_QUEUE_FLAGS),
        ];
        assert_eq!(find_gct_queue_family(&families), Some(2));
        assert_eq!(find_gct_queue_family(&families[..2]), None);
    }

    #[test]
    fn gct_family_ignores_empty_family() {
        let mut empty = family(GCT_QUEUE_FLAGS);
        empty.queue_count = 0;
        assert_eq!(find_gct_queue_family(&[empty]), None);
    }

    #[test]
    fn selection_prefers_discrete_gpu() {
        let picked = select_device(
            vec![
                candidate("igpu", vk::PhysicalDeviceType::INTEGRATED_GPU),
                candidate("dgpu", vk::PhysicalDeviceType::DISCRETE_GPU),
                candidate("cpu", vk::PhysicalDeviceType::CPU),
            ],
            vk::API_VERSION_1_2,
            None,
        )
        .unwrap();
        assert_eq!(picked.name, "dgpu");
    }

    #[test]
    fn selection_skips_incompatible_devices() {
        let mut no_ext = candidate("no-ext", vk::PhysicalDeviceType::DISCRETE_GPU);
        no_ext.missing_extensions = vec![vk::KhrRayQueryFn::name()];
        let mut old = candidate("old", vk::PhysicalDeviceType::DISCRETE_GPU);
        old.api_version = vk::API_VERSION_1_1;
        let mut no_queue = candidate("no-queue", vk::PhysicalDeviceType::DISCRETE_GPU);
        no_queue.gct_queue_family = None;

        let picked = select_device(
            vec![
                no_ext,
                old,
                no_queue,
                candidate("igpu", vk::PhysicalDeviceType::INTEGRATED_GPU),
            ],
            vk::API_VERSION_1_2,
            None,
        )
        .unwrap();
        assert_eq!(picked.name, "igpu");
    }

    #[test]
    fn selection_honours_device_index() {
        let candidates = || {
            vec![
                candidate("a", vk::PhysicalDeviceType::DISCRETE_GPU),
                candidate("b", vk::PhysicalDeviceType::INTEGRATED_GPU),
            ]
        };
        let picked = select_device(candidates(), vk::API_VERSION_1_2, Some(1)).unwrap();
        assert_eq!(picked.name, "b");
        assert!(select_device(candidates(), vk::API_VERSION_1_2, Some(2)).is_err());
    }

    #[test]
    fn selection_fails_without_compatible_device() {
        let mut old = candidate("old", vk::PhysicalDeviceType::DISCRETE_GPU);
        old.api_version = vk::API_VERSION_1_0;
        assert!(select_device(vec![old], vk::API_VERSION_1_2, None).is_err());
    }
}
