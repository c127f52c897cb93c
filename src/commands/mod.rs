// Copyright 2025 Muvon Un Limited
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub mod doctor;
pub mod index;
pub mod list;
pub mod search;
pub mod serve;
pub mod setup;

pub use doctor::DoctorArgs;
pub use index::IndexArgs;
pub use list::ListArgs;
pub use search::SearchArgs;
pub use serve::ServeArgs;
pub use setup::SetupArgs;
