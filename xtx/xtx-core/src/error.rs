//
// Licensed to the Apache Software Foundation (ASF) under one or more
// contributor license agreements.  See the NOTICE file distributed with
// this work for additional information regarding copyright ownership.
// The ASF licenses this file to You under the Apache License, Version 2.0
// (the "License"); you may not use this file except in compliance with
// the License.  You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use thiserror::Error;

/// Error taxonomy of the Gram pipeline.
///
/// Device and collective errors are not recoverable at this layer: the current
/// pipeline call is aborted and the error is handed to the caller unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GramError {
    /// Stream, event or handle creation/destruction failed.
    #[error("Device resource error: {0}")]
    DeviceResource(String),

    /// GEMM, copy, record or synchronize failed.
    #[error("Device operation error: {0}")]
    DeviceOperation(String),

    /// A reduction backend failed.
    #[error("Collective error: {0}")]
    Collective(String),

    /// Input violates a precondition; raised before any device work is issued.
    #[error("Precondition violated: {0}")]
    Precondition(String),

    #[error("Memory allocation failed: {0}")]
    MemoryAllocation(String),
}

impl GramError {
    /// Short name of the error kind, used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            GramError::DeviceResource(_) => "device-resource",
            GramError::DeviceOperation(_) => "device-operation",
            GramError::Collective(_) => "collective",
            GramError::Precondition(_) => "precondition",
            GramError::MemoryAllocation(_) => "memory-allocation",
        }
    }
}

pub type Result<T> = std::result::Result<T, GramError>;

/// Human-readable name for a CUDA runtime error code.
pub fn cuda_error_to_string(code: i32) -> &'static str {
    match code {
        0 => "cudaSuccess",
        1 => "cudaErrorInvalidValue",
        2 => "cudaErrorMemoryAllocation",
        3 => "cudaErrorInitializationError",
        4 => "cudaErrorCudartUnloading",
        100 => "cudaErrorNoDevice",
        101 => "cudaErrorInvalidDevice",
        400 => "cudaErrorInvalidResourceHandle",
        600 => "cudaErrorNotReady",
        700 => "cudaErrorIllegalAddress",
        999 => "cudaErrorUnknown",
        _ => "Unknown CUDA error",
    }
}
