// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Groups let independently configured modules share one buffered stream,
//! optionally replicated per attached device.

mod registry;
mod route;
mod spec;

pub use registry::{FlushSummary, Group, GroupRegistry, MAX_GROUP_SLOTS};
pub use route::RouteTable;
pub use spec::{GroupId, GroupSpec, MAX_FILE_NAME_LEN, MAX_GROUP_NAME_LEN, MAX_PATH_LEN};
