//! Process-local device and template cache.
//!
//! Entries are filled lazily from the [`DeviceDirectory`] and live until a
//! notification evicts them. There is no expiry: every metadata change must
//! be announced on the notification exchange for caches to stay correct.

use crate::directory::{DeviceDirectory, DirectoryError, Template};
use crate::model::{Notification, NotificationCategory};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct TemplateCache {
    directory: Arc<dyn DeviceDirectory>,
    // device id -> template id
    devices: RwLock<HashMap<String, String>>,
    templates: RwLock<HashMap<String, Arc<Template>>>,
}

impl TemplateCache {
    pub fn new(directory: Arc<dyn DeviceDirectory>) -> Self {
        Self {
            directory,
            devices: RwLock::new(HashMap::new()),
            templates: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve a device's template, consulting the directory on a miss.
    /// Unknown devices and templates are not remembered.
    pub async fn template_for(
        &self,
        device_id: &str,
    ) -> Result<Option<Arc<Template>>, DirectoryError> {
        let cached = self.devices.read().get(device_id).cloned();
        let template_id = match cached {
            Some(id) => id,
            None => match self.directory.device(device_id).await? {
                Some(device) => {
                    self.devices
                        .write()
                        .insert(device_id.to_string(), device.template_id.clone());
                    device.template_id
                }
                None => return Ok(None),
            },
        };

        let cached = self.templates.read().get(&template_id).cloned();
        if let Some(template) = cached {
            return Ok(Some(template));
        }

        match self.directory.template(&template_id).await? {
            Some(template) => {
                let template = Arc::new(template);
                self.templates
                    .write()
                    .insert(template_id, Arc::clone(&template));
                Ok(Some(template))
            }
            None => Ok(None),
        }
    }

    pub fn remove_device(&self, device_id: &str) -> bool {
        self.devices.write().remove(device_id).is_some()
    }

    /// Evicts the schema only; device mappings to the template stay valid.
    pub fn remove_template(&self, template_id: &str) -> bool {
        self.templates.write().remove(template_id).is_some()
    }

    /// Apply an invalidation notification. Returns true if an entry was evicted.
    pub fn apply(&self, notification: &Notification) -> bool {
        let evicted = match (notification.category, notification) {
            (
                NotificationCategory::DeviceTemplateChanged,
                Notification {
                    device_id: Some(device_id),
                    ..
                },
            ) => self.remove_device(device_id),
            (
                NotificationCategory::TemplateChanged,
                Notification {
                    template_id: Some(template_id),
                    ..
                },
            ) => self.remove_template(template_id),
            _ => {
                warn!(?notification, "Notification without a target id");
                return false;
            }
        };
        debug!(?notification, evicted, "Applied cache notification");
        evicted
    }

    pub fn cached_devices(&self) -> usize {
        self.devices.read().len()
    }

    pub fn cached_templates(&self) -> usize {
        self.templates.read().len()
    }
}
