// 后端接口
//
// transport 定义注入的传输能力，http 是基于 reqwest 的实现，
// client 在其上提供强类型的接口调用并完成错误分类。

pub mod client;
pub mod http;
pub mod transport;
pub mod types;

#[cfg(test)]
pub mod mock;

pub use client::{UploadApi, DEFAULT_REQUEST_TIMEOUT};
pub use http::{HttpTransport, TokenStore};
pub use transport::{ApiRequest, ApiResponse, FilePart, Method, RequestBody, Transport, TransportError};
