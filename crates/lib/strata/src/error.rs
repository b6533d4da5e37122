use custom_error::custom_error;
use strata_backend::BackendError;

use crate::{buffer_pool::PageRegion, flatten::StreamKind};

custom_error! {pub RenderError
    PageCapacity{mesh: String, stream: StreamKind, region: PageRegion, bytes: u64, capacity: u64} = "mesh '{mesh}' needs {bytes} {region} bytes but a {stream} page holds {capacity}; raise the page size",
    OffsetOverflow{mesh: String, stream: StreamKind} = "offsets of mesh '{mesh}' overflow 32 bits in the {stream} stream",
    PageFull{page: usize, region: PageRegion, requested: u64, used: u64, capacity: u64} = "page {page} cannot take {requested} more {region} bytes ({used}/{capacity} used)",
    InvalidConfig{reason: String} = "invalid renderer config: {reason}",
    Backend{source: BackendError} = "gpu backend: {source}",
}
