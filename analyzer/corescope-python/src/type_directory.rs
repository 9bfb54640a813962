use corescope_map::{GuestWidth, VirtualAddressMap};
use std::collections::HashMap;

/// Python type objects seen in the core, with their best-known names.
#[derive(Default)]
pub struct TypeDirectory {
    type_to_name: HashMap<u64, String>,
}

impl TypeDirectory {
    /// Register a type object, preferring the name stored in the type
    /// itself over `suggested_name`; returns the name recorded.
    pub fn register_type<W: GuestWidth>(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        python_type: u64,
        suggested_name: &str,
    ) -> String {
        if let Some(existing) = self.type_to_name.get_mut(&python_type) {
            if existing.is_empty() && !suggested_name.is_empty() {
                suggested_name.clone_into(existing);
            }
            return existing.clone();
        }
        let name = Self::name_from_type(map, python_type)
            .unwrap_or_else(|| suggested_name.to_owned());
        self.type_to_name.insert(python_type, name.clone());
        name
    }

    /// The type's own name pointer sits one word after its size field.
    fn name_from_type<W: GuestWidth>(
        map: &VirtualAddressMap<'_, W>,
        python_type: u64,
    ) -> Option<String> {
        let word = W::WORD_BYTES as usize;
        let type_image = map.find_mapped_image(python_type)?;
        if type_image.len() < 4 * word {
            log::warn!("python type at {python_type:#x} is not fully mapped");
            return None;
        }
        let name_address = W::read_word(&type_image[3 * word..]);
        let name_image = map.find_mapped_image(name_address)?;
        let length = name_image.iter().position(|&b| b == 0)?;
        (length > 0).then(|| String::from_utf8_lossy(&name_image[..length]).into_owned())
    }

    #[must_use]
    pub fn name_of(&self, python_type: u64) -> Option<&str> {
        self.type_to_name.get(&python_type).map(String::as_str)
    }

    #[must_use]
    pub fn has_type(&self, python_type: u64) -> bool {
        self.type_to_name.contains_key(&python_type)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.type_to_name.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.type_to_name.is_empty()
    }
}
