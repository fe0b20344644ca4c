//! Dynamic binding to the native libspdm wrapper shared library.
//!
//! The wrapper exports a flat C API over the libspdm requester plus a
//! `set_callbacks` hook taking a table of function pointers. Callback
//! trampolines are `extern "C"` functions that forward into the
//! [`EngineCallbacks`] registered for the active session; the bridge
//! guarantees at most one session drives the native library at a time,
//! which is what makes the process-global trampoline slot sound.

use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use libloading::Library;

use crate::driver::callbacks::EngineCallbacks;
use crate::error::ProtocolError;

use super::{
    DigestsOut, EngineParameter, MeasurementsOut, RawStatus, SessionOut, SpdmEngine,
    MAX_SPDM_BUFFER_SIZE, SHA384_LEN,
};

static ACTIVE_CALLBACKS: OnceLock<Mutex<Option<Arc<EngineCallbacks>>>> = OnceLock::new();
static ACTIVE_CONTEXT_SIZE: AtomicUsize = AtomicUsize::new(0);

fn active_callbacks() -> &'static Mutex<Option<Arc<EngineCallbacks>>> {
    ACTIVE_CALLBACKS.get_or_init(|| Mutex::new(None))
}

type PrintCallback = unsafe extern "C" fn(*const std::ffi::c_char);
type SendMessageCallback = unsafe extern "C" fn(*mut c_void, usize, *const c_void, u64) -> u32;
type ReceiveMessageCallback =
    unsafe extern "C" fn(*mut c_void, *mut usize, *mut *mut c_void, u64) -> u32;
type DataSignCallback = unsafe extern "C" fn(
    u16,
    u8,
    u16,
    u32,
    bool,
    *const u8,
    usize,
    *mut u8,
    *mut usize,
) -> bool;

/// Mirror of the wrapper's `session_callbacks_t`. Slots the wrapper fills
/// with its own defaults stay null.
#[repr(C)]
struct SessionCallbacksTable {
    print_callback: Option<PrintCallback>,
    mctp_encode_callback: Option<unsafe extern "C" fn()>,
    mctp_decode_callback: Option<unsafe extern "C" fn()>,
    spdm_device_send_message_callback: Option<SendMessageCallback>,
    spdm_device_receive_message_callback: Option<ReceiveMessageCallback>,
    spdm_device_acquire_sender_buffer_callback: Option<unsafe extern "C" fn()>,
    spdm_device_release_sender_buffer_callback: Option<unsafe extern "C" fn()>,
    spdm_device_acquire_receiver_buffer_callback: Option<unsafe extern "C" fn()>,
    spdm_device_release_receiver_buffer_callback: Option<unsafe extern "C" fn()>,
    spdm_requester_data_sign_callback: Option<DataSignCallback>,
}

unsafe extern "C" fn print_trampoline(message: *const std::ffi::c_char) {
    if message.is_null() {
        return;
    }
    let message = unsafe { std::ffi::CStr::from_ptr(message) };
    tracing::debug!(target: "spdm_wrapper", "{}", message.to_string_lossy());
}

unsafe extern "C" fn send_trampoline(
    spdm_context: *mut c_void,
    request_size: usize,
    request: *const c_void,
    _timeout: u64,
) -> u32 {
    let Some(callbacks) = active_callbacks().lock().ok().and_then(|g| g.clone()) else {
        return RawStatus::SPDM_INTERNAL_EXCEPTION.value();
    };

    let request = unsafe { std::slice::from_raw_parts(request.cast::<u8>(), request_size) };
    let context_size = ACTIVE_CONTEXT_SIZE.load(Ordering::Acquire);
    let context = unsafe { std::slice::from_raw_parts(spdm_context.cast::<u8>(), context_size) };

    callbacks.device_send(context, request).value()
}

unsafe extern "C" fn receive_trampoline(
    _spdm_context: *mut c_void,
    response_size: *mut usize,
    response: *mut *mut c_void,
    _timeout: u64,
) -> u32 {
    let Some(callbacks) = active_callbacks().lock().ok().and_then(|g| g.clone()) else {
        return RawStatus::SPDM_INTERNAL_EXCEPTION.value();
    };

    let (status, body) = callbacks.device_receive();
    if !status.is_success() {
        return status.value();
    }

    let capacity = unsafe { *response_size };
    if body.len() > capacity {
        tracing::error!(
            needed = body.len(),
            capacity,
            "receive buffer too small for device response"
        );
        return RawStatus::SPDM_INTERNAL_EXCEPTION.value();
    }

    let destination = unsafe { (*response).cast::<u8>() };
    unsafe {
        std::ptr::copy_nonoverlapping(body.as_ptr(), destination, body.len());
        *response_size = body.len();
    }
    RawStatus::SUCCESS.value()
}

unsafe extern "C" fn sign_trampoline(
    _spdm_version: u16,
    _op_code: u8,
    req_base_asym_alg: u16,
    base_hash_algo: u32,
    _is_data_hash: bool,
    message: *const u8,
    message_size: usize,
    signature: *mut u8,
    sig_size: *mut usize,
) -> bool {
    let Some(callbacks) = active_callbacks().lock().ok().and_then(|g| g.clone()) else {
        return false;
    };

    let data = unsafe { std::slice::from_raw_parts(message, message_size) };
    let Some(produced) = callbacks.sign(data, req_base_asym_alg, base_hash_algo) else {
        return false;
    };

    if produced.len() > unsafe { *sig_size } {
        return false;
    }
    unsafe {
        std::ptr::copy_nonoverlapping(produced.as_ptr(), signature, produced.len());
        *sig_size = produced.len();
    }
    true
}

/// libspdm `libspdm_data_type_t` selectors used by the parameter setter.
mod data_type {
    pub const CAPABILITY_FLAGS: u32 = 2;
    pub const CAPABILITY_CT_EXPONENT: u32 = 3;
    pub const MEASUREMENT_SPEC: u32 = 5;
    pub const BASE_ASYM_ALGO: u32 = 7;
    pub const BASE_HASH_ALGO: u32 = 8;
    pub const DHE_NAME_GROUP: u32 = 9;
    pub const AEAD_CIPHER_SUITE: u32 = 10;
    pub const REQ_BASE_ASYM_ALG: u32 = 11;
    pub const KEY_SCHEDULE: u32 = 12;
    pub const OTHER_PARAMS_SUPPORT: u32 = 13;
    pub const LOCAL_PUBLIC_CERT_CHAIN: u32 = 16;
}

/// `libspdm_data_parameter_t`: location selector plus additional data.
#[repr(C)]
struct DataParameter {
    location: u32,
    additional_data: [u8; 4],
}

const LOCATION_LOCAL: u32 = 1;

/// Engine backed by the native wrapper loaded at runtime.
pub struct NativeEngine {
    library: Library,
    context: Vec<u8>,
    scratch: Vec<u8>,
    context_size: usize,
}

// The native context is only ever touched from the owning bridge task.
unsafe impl Send for NativeEngine {}

impl NativeEngine {
    /// Load the wrapper shared library and query the context size.
    pub fn load(library_path: &str) -> Result<Self, ProtocolError> {
        let library = unsafe { Library::new(library_path) }
            .map_err(|e| ProtocolError::EngineUnavailable(e.to_string()))?;

        let context_size = unsafe {
            let get_size: libloading::Symbol<unsafe extern "C" fn() -> usize> = library
                .get(b"libspdm_get_context_size_w")
                .map_err(|e| ProtocolError::EngineUnavailable(e.to_string()))?;
            get_size()
        };

        Ok(Self {
            library,
            context: vec![0u8; context_size],
            scratch: Vec::new(),
            context_size,
        })
    }

    fn context_ptr(&mut self) -> *mut c_void {
        self.context.as_mut_ptr().cast()
    }

    unsafe fn symbol<T>(&self, name: &[u8]) -> Option<libloading::Symbol<'_, T>> {
        unsafe { self.library.get(name).ok() }
    }

    fn set_data(&mut self, data_type: u32, slot_id: Option<u8>, value: &[u8]) -> RawStatus {
        let mut parameter = DataParameter {
            location: LOCATION_LOCAL,
            additional_data: [0u8; 4],
        };
        if let Some(slot_id) = slot_id {
            parameter.additional_data[0] = slot_id;
        }

        let context = self.context_ptr();
        unsafe {
            let set_data: libloading::Symbol<
                unsafe extern "C" fn(*mut c_void, u32, *const DataParameter, *const c_void, usize) -> u32,
            > = match self.symbol(b"libspdm_set_data_w") {
                Some(symbol) => symbol,
                None => return RawStatus::SPDM_INTERNAL_EXCEPTION,
            };
            RawStatus::new(set_data(
                context,
                data_type,
                &parameter,
                value.as_ptr().cast(),
                value.len(),
            ))
        }
    }
}

impl SpdmEngine for NativeEngine {
    fn context_size(&self) -> usize {
        self.context_size
    }

    fn register_callbacks(&mut self, callbacks: Arc<EngineCallbacks>) {
        if let Ok(mut active) = active_callbacks().lock() {
            *active = Some(callbacks);
        }
        ACTIVE_CONTEXT_SIZE.store(self.context_size, Ordering::Release);

        let table = SessionCallbacksTable {
            print_callback: Some(print_trampoline),
            mctp_encode_callback: None,
            mctp_decode_callback: None,
            spdm_device_send_message_callback: Some(send_trampoline),
            spdm_device_receive_message_callback: Some(receive_trampoline),
            spdm_device_acquire_sender_buffer_callback: None,
            spdm_device_release_sender_buffer_callback: None,
            spdm_device_acquire_receiver_buffer_callback: None,
            spdm_device_release_receiver_buffer_callback: None,
            spdm_requester_data_sign_callback: Some(sign_trampoline),
        };

        unsafe {
            if let Some(set_callbacks) = self
                .symbol::<unsafe extern "C" fn(*const SessionCallbacksTable)>(b"set_callbacks")
            {
                set_callbacks(&table);
            }
        }
    }

    fn prepare_context(&mut self, sender_receive_buffer_size: u32) -> RawStatus {
        let context = self.context_ptr();
        unsafe {
            let prepare: libloading::Symbol<unsafe extern "C" fn(*mut c_void, u32) -> u32> =
                match self.symbol(b"libspdm_prepare_context_w") {
                    Some(symbol) => symbol,
                    None => return RawStatus::SPDM_INTERNAL_EXCEPTION,
                };
            RawStatus::new(prepare(context, sender_receive_buffer_size))
        }
    }

    fn required_scratch_size(&mut self) -> usize {
        let context = self.context_ptr();
        unsafe {
            let required: libloading::Symbol<unsafe extern "C" fn(*mut c_void) -> usize> =
                match self.symbol(b"libspdm_get_sizeof_required_scratch_buffer_w") {
                    Some(symbol) => symbol,
                    None => return 0,
                };
            required(context)
        }
    }

    fn set_scratch_buffer(&mut self, size: usize) {
        self.scratch = vec![0u8; size];
        let context = self.context_ptr();
        let scratch = self.scratch.as_mut_ptr().cast::<c_void>();
        unsafe {
            if let Some(set_scratch) = self
                .symbol::<unsafe extern "C" fn(*mut c_void, *mut c_void, usize)>(
                    b"libspdm_set_scratch_buffer_w",
                )
            {
                set_scratch(context, scratch, size);
            }
        }
    }

    fn set_parameter(&mut self, parameter: EngineParameter) -> RawStatus {
        use EngineParameter::*;
        match parameter {
            CtExponent(v) => self.set_data(data_type::CAPABILITY_CT_EXPONENT, None, &[v]),
            CapabilityFlags(v) => {
                self.set_data(data_type::CAPABILITY_FLAGS, None, &v.to_le_bytes())
            }
            MeasurementSpec(v) => self.set_data(data_type::MEASUREMENT_SPEC, None, &[v]),
            BaseAsymAlgo(v) => self.set_data(data_type::BASE_ASYM_ALGO, None, &v.to_le_bytes()),
            BaseHashAlgo(v) => self.set_data(data_type::BASE_HASH_ALGO, None, &v.to_le_bytes()),
            DheNamedGroup(v) => self.set_data(data_type::DHE_NAME_GROUP, None, &v.to_le_bytes()),
            AeadCipherSuite(v) => {
                self.set_data(data_type::AEAD_CIPHER_SUITE, None, &v.to_le_bytes())
            }
            ReqBaseAsymAlgo(v) => {
                self.set_data(data_type::REQ_BASE_ASYM_ALG, None, &v.to_le_bytes())
            }
            KeySchedule(v) => self.set_data(data_type::KEY_SCHEDULE, None, &v.to_le_bytes()),
            OtherParamsSupport(v) => self.set_data(data_type::OTHER_PARAMS_SUPPORT, None, &[v]),
        }
    }

    fn set_local_certificate_chain(&mut self, slot_id: u8, encoded_chain: &[u8]) -> RawStatus {
        self.set_data(data_type::LOCAL_PUBLIC_CERT_CHAIN, Some(slot_id), encoded_chain)
    }

    fn init_connection(&mut self, version_only: bool) -> RawStatus {
        let context = self.context_ptr();
        unsafe {
            let init: libloading::Symbol<unsafe extern "C" fn(*mut c_void, bool) -> u32> =
                match self.symbol(b"libspdm_init_connection_w") {
                    Some(symbol) => symbol,
                    None => return RawStatus::SPDM_INTERNAL_EXCEPTION,
                };
            RawStatus::new(init(context, version_only))
        }
    }

    fn negotiated_version(&self) -> u8 {
        let context = self.context.as_ptr().cast_mut().cast::<c_void>();
        let mut version = 0u8;
        unsafe {
            if let Some(get_version) =
                self.symbol::<unsafe extern "C" fn(*mut c_void, *mut u8)>(b"libspdm_get_version_w")
            {
                get_version(context, &mut version);
            }
        }
        version
    }

    fn capability_supported(&self, responder_flag: u32) -> bool {
        let context = self.context.as_ptr().cast_mut().cast::<c_void>();
        unsafe {
            match self.symbol::<unsafe extern "C" fn(*mut c_void, u32) -> bool>(
                b"libspdm_is_capabilities_flag_supported_by_responder",
            ) {
                Some(supported) => supported(context, responder_flag),
                None => false,
            }
        }
    }

    fn get_digests(&mut self, out: &mut DigestsOut) -> RawStatus {
        let context = self.context_ptr();
        let mut slot_mask = 0u8;
        let mut buffer = vec![0u8; MAX_SPDM_BUFFER_SIZE];

        let status = unsafe {
            let get_digest: libloading::Symbol<
                unsafe extern "C" fn(*mut c_void, *const u32, *mut u8, *mut c_void) -> u32,
            > = match self.symbol(b"libspdm_get_digest_w") {
                Some(symbol) => symbol,
                None => return RawStatus::SPDM_INTERNAL_EXCEPTION,
            };
            RawStatus::new(get_digest(
                context,
                std::ptr::null(),
                &mut slot_mask,
                buffer.as_mut_ptr().cast(),
            ))
        };

        if status.is_success() {
            let populated = slot_mask.count_ones() as usize;
            buffer.truncate(populated * SHA384_LEN);
            out.slot_mask = slot_mask;
            out.buffer = buffer;
        }
        status
    }

    fn get_certificate(&mut self, slot_id: u8, out: &mut Vec<u8>) -> RawStatus {
        let context = self.context_ptr();
        let mut chain = vec![0u8; MAX_SPDM_BUFFER_SIZE];
        let mut chain_size = MAX_SPDM_BUFFER_SIZE;

        let status = unsafe {
            let get_certificate: libloading::Symbol<
                unsafe extern "C" fn(*mut c_void, *const u32, u8, *mut usize, *mut c_void) -> u32,
            > = match self.symbol(b"libspdm_get_certificate_w") {
                Some(symbol) => symbol,
                None => return RawStatus::SPDM_INTERNAL_EXCEPTION,
            };
            RawStatus::new(get_certificate(
                context,
                std::ptr::null(),
                slot_id,
                &mut chain_size,
                chain.as_mut_ptr().cast(),
            ))
        };

        if status.is_success() {
            chain.truncate(chain_size);
            *out = chain;
        }
        status
    }

    fn get_measurements(
        &mut self,
        request_attributes: u8,
        operation: u8,
        slot_id: u8,
        out: &mut MeasurementsOut,
    ) -> RawStatus {
        let context = self.context_ptr();
        let mut number_of_blocks = 0u8;
        let mut record_length = MAX_SPDM_BUFFER_SIZE as u32;
        let mut record = vec![0u8; MAX_SPDM_BUFFER_SIZE];

        let status = unsafe {
            let get_measurement: libloading::Symbol<
                unsafe extern "C" fn(
                    *mut c_void,
                    *const u32,
                    u8,
                    u8,
                    u8,
                    *mut u8,
                    *mut u8,
                    *mut u32,
                    *mut c_void,
                ) -> u32,
            > = match self.symbol(b"libspdm_get_measurement_w") {
                Some(symbol) => symbol,
                None => return RawStatus::SPDM_INTERNAL_EXCEPTION,
            };
            RawStatus::new(get_measurement(
                context,
                std::ptr::null(),
                request_attributes,
                operation,
                slot_id,
                std::ptr::null_mut(),
                &mut number_of_blocks,
                &mut record_length,
                record.as_mut_ptr().cast(),
            ))
        };

        if status.is_success() {
            record.truncate(record_length as usize);
            out.number_of_blocks = number_of_blocks;
            out.record = record;
        }
        status
    }

    fn set_certificate(&mut self, slot_id: u8, chain_image: &[u8], chain_len: usize) -> RawStatus {
        let context = self.context_ptr();
        unsafe {
            let set_certificate: libloading::Symbol<
                unsafe extern "C" fn(*mut c_void, *const u32, u8, *const c_void, usize) -> u32,
            > = match self.symbol(b"libspdm_set_certificate_w") {
                Some(symbol) => symbol,
                None => return RawStatus::SPDM_INTERNAL_EXCEPTION,
            };
            RawStatus::new(set_certificate(
                context,
                std::ptr::null(),
                slot_id,
                chain_image.as_ptr().cast(),
                chain_len,
            ))
        }
    }

    fn start_session(
        &mut self,
        measurement_hash_type: u8,
        slot_id: u8,
        session_policy: u8,
        out: &mut SessionOut,
    ) -> RawStatus {
        let context = self.context_ptr();
        let mut session_id = 0u32;
        let mut heartbeat_period = 0u8;
        let mut measurement_hash = [0u8; SHA384_LEN];

        let status = unsafe {
            let start_session: libloading::Symbol<
                unsafe extern "C" fn(
                    *mut c_void,
                    bool,
                    *const c_void,
                    u16,
                    u8,
                    u8,
                    u8,
                    *mut u32,
                    *mut u8,
                    *mut c_void,
                ) -> u32,
            > = match self.symbol(b"libspdm_start_session_w") {
                Some(symbol) => symbol,
                None => return RawStatus::SPDM_INTERNAL_EXCEPTION,
            };
            RawStatus::new(start_session(
                context,
                false,
                std::ptr::null(),
                0,
                measurement_hash_type,
                slot_id,
                session_policy,
                &mut session_id,
                &mut heartbeat_period,
                measurement_hash.as_mut_ptr().cast(),
            ))
        };

        out.session_id = session_id;
        out.heartbeat_period = heartbeat_period;
        out.measurement_hash = measurement_hash;
        status
    }

    fn stop_session(&mut self, session_id: u32, attributes: u8) -> RawStatus {
        let context = self.context_ptr();
        unsafe {
            let stop_session: libloading::Symbol<unsafe extern "C" fn(*mut c_void, u32, u8) -> u32> =
                match self.symbol(b"libspdm_stop_session_w") {
                    Some(symbol) => symbol,
                    None => return RawStatus::SPDM_INTERNAL_EXCEPTION,
                };
            RawStatus::new(stop_session(context, session_id, attributes))
        }
    }

    fn send_receive_in_session(
        &mut self,
        session_id: u32,
        request: &[u8],
        response: &mut Vec<u8>,
    ) -> RawStatus {
        let context = self.context_ptr();
        let mut buffer = vec![0u8; MAX_SPDM_BUFFER_SIZE];
        let mut response_size = MAX_SPDM_BUFFER_SIZE;
        let session_id_param = session_id;

        let status = unsafe {
            let send_receive: libloading::Symbol<
                unsafe extern "C" fn(
                    *mut c_void,
                    *const u32,
                    bool,
                    *const c_void,
                    usize,
                    *mut c_void,
                    *mut usize,
                ) -> u32,
            > = match self.symbol(b"libspdm_send_receive_data_w") {
                Some(symbol) => symbol,
                None => return RawStatus::SPDM_INTERNAL_EXCEPTION,
            };
            RawStatus::new(send_receive(
                context,
                &session_id_param,
                false,
                request.as_ptr().cast(),
                request.len(),
                buffer.as_mut_ptr().cast(),
                &mut response_size,
            ))
        };

        if status.is_success() {
            buffer.truncate(response_size);
            *response = buffer;
        }
        status
    }

    fn deinit(&mut self) {
        let context = self.context_ptr();
        unsafe {
            if let Some(deinit) =
                self.symbol::<unsafe extern "C" fn(*mut c_void)>(b"libspdm_deinit_context_w")
            {
                deinit(context);
            }
        }
        if let Ok(mut active) = active_callbacks().lock() {
            *active = None;
        }
    }
}
