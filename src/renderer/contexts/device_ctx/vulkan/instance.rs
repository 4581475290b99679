use std::ffi::{c_char, c_void, CStr};
use ash::vk;
use color_eyre::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::window::Window;
use crate::renderer::error::DriverResultExt;

/// Loads Vulkan and keeps the instance (and its validation messenger) alive.
pub struct VulkanInstance {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanInstance {
    const VALIDATION_LAYER: &'static CStr = c"VK_LAYER_KHRONOS_validation";

    pub fn new(validation: bool, window: Option<&Window>) -> Result<Self> {
        const OP: &str = "create instance";
        let entry = unsafe { ash::Entry::load() }.driver_err(OP)?;

        let validation = validation && Self::validation_layer_supported(&entry)?;
        let application_info = vk::ApplicationInfo::default()
            .application_name(c"prism")
            .engine_name(c"prism")
            .api_version(vk::API_VERSION_1_3);
        let enabled_layer_names: Vec<*const c_char> = if validation {
            vec![Self::VALIDATION_LAYER.as_ptr()]
        } else {
            Vec::new()
        };
        let enabled_extension_names: Vec<*const c_char> = Self::required_extensions(validation, window)?
            .iter()
            .map(|ext| ext.as_ptr())
            .collect();

        let mut debug_info = debug_utils_messenger_create_info();
        let mut instance_info = vk::InstanceCreateInfo::default()
            .application_info(&application_info)
            .enabled_layer_names(&enabled_layer_names)
            .enabled_extension_names(&enabled_extension_names);
        if validation {
            instance_info = instance_info.push_next(&mut debug_info);
        }

        #[cfg(target_os = "macos")]
        let instance_info = instance_info.flags(vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR);

        let instance = unsafe { entry.create_instance(&instance_info, None) }.driver_err(OP)?;

        let debug_utils = if validation {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &instance);
            let messenger = unsafe { loader.create_debug_utils_messenger(&debug_utils_messenger_create_info(), None) }
                .driver_err(OP)?;
            Some((loader, messenger))
        } else {
            None
        };

        Ok(Self {
            entry,
            instance,
            debug_utils,
        })
    }

    pub fn create_surface(&self, window: &Window) -> Result<(vk::SurfaceKHR, ash::khr::surface::Instance)> {
        const OP: &str = "create surface";
        let display = window.display_handle().driver_err(OP)?;
        let handle = window.window_handle().driver_err(OP)?;
        let surface = unsafe {
            ash_window::create_surface(&self.entry, &self.instance, display.as_raw(), handle.as_raw(), None)
        }
        .driver_err(OP)?;
        let loader = ash::khr::surface::Instance::new(&self.entry, &self.instance);
        Ok((surface, loader))
    }

    fn required_extensions(validation: bool, window: Option<&Window>) -> Result<Vec<&'static CStr>> {
        let mut exts = match window {
            Some(window) => {
                let display = window.display_handle().driver_err("create instance")?;
                ash_window::enumerate_required_extensions(display.as_raw())
                    .driver_err("create instance")?
                    .iter()
                    .map(|ext| unsafe { CStr::from_ptr(*ext) })
                    .collect::<Vec<_>>()
            }
            None => Vec::new(),
        };

        if validation {
            exts.push(ash::ext::debug_utils::NAME);
        }

        #[cfg(target_os = "macos")]
        {
            exts.push(ash::khr::portability_enumeration::NAME);
            exts.push(ash::khr::get_physical_device_properties2::NAME);
        }

        Ok(exts)
    }

    fn validation_layer_supported(entry: &ash::Entry) -> Result<bool> {
        let layers = unsafe { entry.enumerate_instance_layer_properties() }.driver_err("create instance")?;
        let supported = layers
            .iter()
            .any(|props| props.layer_name_as_c_str().is_ok_and(|name| name == Self::VALIDATION_LAYER));
        if !supported {
            log::warn!("Validation layer {:?} not available, continuing without it", Self::VALIDATION_LAYER);
        }
        Ok(supported)
    }

    /// # Safety
    /// Every object created from this instance must already be destroyed.
    pub unsafe fn destroy(&mut self) {
        unsafe {
            if let Some((loader, messenger)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

fn debug_utils_messenger_create_info() -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    let message_severity = vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR;
    let message_type = vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE;
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(message_severity)
        .message_type(message_type)
        .pfn_user_callback(Some(debug_callback))
}

unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    let msg_type = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "[General]",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "[Performance]",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "[Validation]",
        _ => "[Unknown]",
    };
    let msg = unsafe { CStr::from_ptr((*p_callback_data).p_message) };
    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => log::trace!("{} {:?}", msg_type, msg),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => log::info!("{} {:?}", msg_type, msg),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::warn!("{} {:?}", msg_type, msg),
        _ => log::error!("{} {:?}", msg_type, msg),
    }
    vk::FALSE
}
