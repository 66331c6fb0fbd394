// Extension requests for instance and device creation
//
// A ContextCreateInfo lists what the context must (or may) enable. Device
// extensions that come with a feature struct are tagged with a
// FeatureRequest so device creation knows which structs to chain.

use ash::vk;
use std::ffi::CStr;

/// Extension feature structs the context knows how to query and enable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureRequest {
    AccelerationStructure,
    RayQuery,
}

#[derive(Debug, Clone, Copy)]
pub struct DeviceExtension {
    pub name: &'static CStr,
    /// Optional extensions are enabled when present and never rule out a GPU
    pub optional: bool,
    pub feature: Option<FeatureRequest>,
}

/// Everything needed to bring up a `VulkanContext`
#[derive(Debug, Clone)]
pub struct ContextCreateInfo {
    pub app_name: String,
    pub api_version: u32,
    pub validation: bool,
    /// Index into the compatible device list, `None` picks by score
    pub device_index: Option<usize>,
    pub instance_extensions: Vec<&'static CStr>,
    pub device_extensions: Vec<DeviceExtension>,
}

impl ContextCreateInfo {
    pub fn new(app_name: &str, api_version: u32) -> Self {
        Self {
            app_name: app_name.to_string(),
            api_version,
            validation: false,
            device_index: None,
            instance_extensions: Vec::new(),
            device_extensions: Vec::new(),
        }
    }

    /// Device setup for ray queries against acceleration structures.
    ///
    /// Deferred host operations is a dependency of acceleration structures; it
    /// lets builds run on host threads outside of command submission.
    pub fn ray_query(app_name: &str, api_version: u32) -> Self {
        let mut info = Self::new(app_name, api_version);
        info.add_device_extension(
            ash::extensions::khr::DeferredHostOperations::name(),
            false,
            None,
        );
        info.add_device_extension(
            ash::extensions::khr::AccelerationStructure::name(),
            false,
            Some(FeatureRequest::AccelerationStructure),
        );
        info.add_device_extension(
            vk::KhrRayQueryFn::name(),
            false,
            Some(FeatureRequest::RayQuery),
        );
        info
    }

    pub fn add_instance_extension(&mut self, name: &'static CStr) {
        if !self.instance_extensions.contains(&name) {
            self.instance_extensions.push(name);
        }
    }

    /// Request a device extension. Repeat requests for the same name are ignored.
    pub fn add_device_extension(
        &mut self,
        name: &'static CStr,
        optional: bool,
        feature: Option<FeatureRequest>,
    ) {
        if self.device_extensions.iter().any(|ext| ext.name == name) {
            log::warn!("Device extension {:?} requested twice, keeping first request", name);
            return;
        }

        self.device_extensions.push(DeviceExtension {
            name,
            optional,
            feature,
        });
    }

    pub fn required_device_extensions(&self) -> Vec<&'static CStr> {
        self.device_extensions
            .iter()
            .filter(|ext| !ext.optional)
            .map(|ext| ext.name)
            .collect()
    }

    pub fn optional_device_extensions(&self) -> Vec<&'static CStr> {
        self.device_extensions
            .iter()
            .filter(|ext| ext.optional)
            .map(|ext| ext.name)
            .collect()
    }

    pub fn requests(&self, feature: FeatureRequest) -> bool {
        self.device_extensions
            .iter()
            .any(|ext| ext.feature == Some(feature))
    }
}

/// Returns the entries of `wanted` that `available` doesn't list
pub fn missing_extensions(
    wanted: &[&'static CStr],
    available: &[vk::ExtensionProperties],
) -> Vec<&'static CStr> {
    wanted
        .iter()
        .copied()
        .filter(|name| {
            !available.iter().any(|props| {
                let available_name = unsafe { CStr::from_ptr(props.extension_name.as_ptr()) };
                available_name == *name
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::raw::c_char;

    fn props(name: &CStr) -> vk::ExtensionProperties {
        let mut props = vk::ExtensionProperties::default();
        for (dst, src) in props
            .extension_name
            .iter_mut()
            .zip(name.to_bytes_with_nul())
        {
            *dst = *src as c_char;
        }
        props
    }

    #[test]
    fn ray_query_preset_requests_three_required_extensions_in_order() {
        let info = ContextCreateInfo::ray_query("test", vk::API_VERSION_1_2);
        let names = info.required_device_extensions();

        assert_eq!(
            names,
            vec![
                ash::extensions::khr::DeferredHostOperations::name(),
                ash::extensions::khr::AccelerationStructure::name(),
                vk::KhrRayQueryFn::name(),
            ]
        );
        assert!(info.optional_device_extensions().is_empty());
        assert!(info.requests(FeatureRequest::AccelerationStructure));
        assert!(info.requests(FeatureRequest::RayQuery));
    }

    #[test]
    fn duplicate_device_extension_keeps_first_request() {
        let mut info = ContextCreateInfo::new("test", vk::API_VERSION_1_2);
        info.add_device_extension(vk::KhrRayQueryFn::name(), true, None);
        info.add_device_extension(
            vk::KhrRayQueryFn::name(),
            false,
            Some(FeatureRequest::RayQuery),
        );

        assert_eq!(info.device_extensions.len(), 1);
        assert!(info.device_extensions[0].optional);
        assert!(!info.requests(FeatureRequest::RayQuery));
    }

    #[test]
    fn instance_extensions_are_deduplicated() {
        let mut info = ContextCreateInfo::new("test", vk::API_VERSION_1_2);
        info.add_instance_extension(ash::extensions::ext::DebugUtils::name());
        info.add_instance_extension(ash::extensions::ext::DebugUtils::name());
        assert_eq!(info.instance_extensions.len(), 1);
    }

    #[test]
    fn missing_extensions_reports_only_absent_names() {
        let available = [
            props(ash::extensions::khr::DeferredHostOperations::name()),
            props(ash::extensions::khr::AccelerationStructure::name()),
        ];
        let wanted = ContextCreateInfo::ray_query("test", vk::API_VERSION_1_2)
            .required_device_extensions();

        assert_eq!(
            missing_extensions(&wanted, &available),
            vec![vk::KhrRayQueryFn::name()]
        );
        assert!(missing_extensions(&wanted[..2], &available).is_empty());
    }
}
