//! PE image structures as mapped in guest memory.

mod section;

pub use section::{
    ImageSectionHeader, SectionCharacteristics, SectionTable, IMAGE_SIZEOF_SECTION_HEADER,
    MAX_SECTIONS,
};
