use erupt::vk;

/// Application info for the headless core
pub struct AppInfo {
    pub(crate) name: String,
    pub(crate) version: u32,
    pub(crate) api_version: u32,
    pub(crate) validation: bool,
    pub(crate) buffer_device_address: bool,
}

impl AppInfo {
    pub fn app_version(mut self, major: u32, minor: u32, patch: u32) -> Self {
        self.version = vk::make_version(major, minor, patch);
        self
    }

    pub fn vk_version(mut self, major: u32, minor: u32, patch: u32) -> Self {
        self.api_version = vk::make_version(major, minor, patch);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Enable the `bufferDeviceAddress` feature. Raises the API version to 1.2.
    pub fn buffer_device_address(mut self, enable: bool) -> Self {
        self.buffer_device_address = enable;
        if enable {
            self.api_version = self.api_version.max(vk::make_version(1, 2, 0));
        }
        self
    }
}

impl Default for AppInfo {
    /// Defaults to Vulkan 1.1, with validation layers and device addresses disabled.
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_owned(),
            api_version: vk::make_version(1, 1, 0),
            version: vk::make_version(1, 0, 0),
            validation: false,
            buffer_device_address: false,
        }
    }
}

/// Return the Vulkan-ready version of this engine
pub fn engine_version() -> u32 {
    let part = |s: &str| s.parse().unwrap_or(0);
    vk::make_version(
        part(env!("CARGO_PKG_VERSION_MAJOR")),
        part(env!("CARGO_PKG_VERSION_MINOR")),
        part(env!("CARGO_PKG_VERSION_PATCH")),
    )
}
