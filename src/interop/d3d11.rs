//! D3D11 interop backend for Windows
//!
//! A secondary D3D11 device (with video decode support) renders into shared
//! `B8G8R8A8` textures that are exported by NT handle and imported into the
//! primary wgpu device, which must be running on the DX12 backend. Lock and
//! unlock map to the texture's keyed mutex on key 0.
//!
//! The decode engine reaches the secondary device through a Media Foundation
//! DXGI device manager; the engine owns its own Media Foundation lifetime,
//! this module only makes sure startup happened before the manager exists.

use std::sync::Once;

use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::Graphics::Direct3D::D3D_DRIVER_TYPE_HARDWARE;
use windows::Win32::Graphics::Direct3D11::{
    D3D11_BIND_RENDER_TARGET, D3D11_BIND_SHADER_RESOURCE, D3D11_CREATE_DEVICE_BGRA_SUPPORT,
    D3D11_CREATE_DEVICE_DEBUG, D3D11_CREATE_DEVICE_VIDEO_SUPPORT,
    D3D11_RESOURCE_MISC_SHARED_KEYEDMUTEX, D3D11_RESOURCE_MISC_SHARED_NTHANDLE, D3D11_RLDO_DETAIL,
    D3D11_RLDO_IGNORE_INTERNAL, D3D11_SDK_VERSION, D3D11_TEXTURE2D_DESC, D3D11_USAGE_DEFAULT,
    D3D11CreateDevice, ID3D11Debug, ID3D11Device, ID3D11Multithread, ID3D11Texture2D,
};
use windows::Win32::Graphics::Direct3D12::ID3D12Resource;
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_SAMPLE_DESC};
use windows::Win32::Graphics::Dxgi::{DXGI_SHARED_RESOURCE_READ, IDXGIKeyedMutex, IDXGIResource1};
use windows::Win32::Media::MediaFoundation::{
    IMFDXGIDeviceManager, MFCreateDXGIDeviceManager, MFSTARTUP_LITE, MFStartup,
};
use windows::Win32::Security::SECURITY_ATTRIBUTES;
use windows::core::Interface;

use super::{
    BridgeSurface, DecodeTarget, DeviceManagerHandle, DisplayTexture, InteropBridge, InteropError,
    RenderContext, TextureSize,
};

/// MF_VERSION from the SDK headers.
const MF_VERSION: u32 = 0x0002_0070;

static MF_STARTUP: Once = Once::new();

fn ensure_media_foundation() {
    MF_STARTUP.call_once(|| unsafe {
        if let Err(e) = MFStartup(MF_VERSION, MFSTARTUP_LITE) {
            log::warn!("MFStartup failed: {}", e);
        }
    });
}

pub struct D3d11Bridge {
    device: ID3D11Device,
    manager: IMFDXGIDeviceManager,
    render_device: wgpu::Device,
}

// SAFETY: the D3D11 device is created below with multithread protection
// enabled, the MF DXGI device manager is documented thread-safe, and
// wgpu::Device is Send + Sync. The decode engine's internal threads call
// into the same device concurrently by design.
unsafe impl Send for D3d11Bridge {}
unsafe impl Sync for D3d11Bridge {}

impl D3d11Bridge {
    /// Run the gated initialization sequence. Every step must succeed for
    /// the bridge to exist; the caller treats any error as a permanently
    /// invalid interop context.
    pub fn open(render: &RenderContext) -> Result<Self, InteropError> {
        ensure_media_foundation();

        let mut reset_token: u32 = 0;
        let mut manager: Option<IMFDXGIDeviceManager> = None;
        unsafe {
            MFCreateDXGIDeviceManager(&mut reset_token, &mut manager).map_err(|e| {
                InteropError::InitError(format!("MFCreateDXGIDeviceManager failed: {}", e))
            })?;
        }
        let manager = manager.ok_or_else(|| {
            InteropError::InitError("MFCreateDXGIDeviceManager returned null".to_string())
        })?;

        let mut flags = D3D11_CREATE_DEVICE_BGRA_SUPPORT | D3D11_CREATE_DEVICE_VIDEO_SUPPORT;
        if cfg!(debug_assertions) {
            flags |= D3D11_CREATE_DEVICE_DEBUG;
        }

        let mut device: Option<ID3D11Device> = None;
        unsafe {
            D3D11CreateDevice(
                None,
                D3D_DRIVER_TYPE_HARDWARE,
                None,
                flags,
                None,
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                None,
            )
            .map_err(|e| InteropError::InitError(format!("D3D11CreateDevice failed: {}", e)))?;
        }
        let device = device.ok_or_else(|| {
            InteropError::InitError("D3D11CreateDevice returned null device".to_string())
        })?;

        // The decode engine's internal threads hit this device concurrently
        // with the consumer thread, so multithread protection is mandatory.
        let multithread: ID3D11Multithread = device.cast().map_err(|e| {
            InteropError::InitError(format!("ID3D11Multithread not supported: {}", e))
        })?;
        unsafe {
            let _ = multithread.SetMultithreadProtected(true);
        }

        unsafe {
            manager
                .ResetDevice(&device, reset_token)
                .map_err(|e| InteropError::InitError(format!("ResetDevice failed: {}", e)))?;
        }

        // The bridge-open step: shared handles can only be imported when the
        // primary device runs on DX12.
        let is_dx12 = unsafe {
            render
                .device
                .as_hal::<wgpu::hal::api::Dx12, _, bool>(|hal_device| hal_device.is_some())
        };
        if !is_dx12 {
            return Err(InteropError::InitError(
                "primary wgpu device is not using the DX12 backend".to_string(),
            ));
        }

        Ok(Self {
            device,
            manager,
            render_device: render.device.clone(),
        })
    }
}

impl InteropBridge for D3d11Bridge {
    fn device_manager(&self) -> DeviceManagerHandle {
        DeviceManagerHandle(self.manager.as_raw() as usize as u64)
    }

    fn create_surface(&self, size: TextureSize) -> Result<Box<dyn BridgeSurface>, InteropError> {
        if size.width == 0 || size.height == 0 {
            return Err(InteropError::SurfaceError(format!(
                "degenerate surface size {}x{}",
                size.width, size.height
            )));
        }

        let desc = D3D11_TEXTURE2D_DESC {
            Width: size.width,
            Height: size.height,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT_B8G8R8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: (D3D11_BIND_RENDER_TARGET.0 | D3D11_BIND_SHADER_RESOURCE.0) as u32,
            CPUAccessFlags: 0,
            MiscFlags: (D3D11_RESOURCE_MISC_SHARED_KEYEDMUTEX.0
                | D3D11_RESOURCE_MISC_SHARED_NTHANDLE.0) as u32,
        };

        let texture: ID3D11Texture2D = unsafe {
            let mut texture: Option<ID3D11Texture2D> = None;
            self.device
                .CreateTexture2D(&desc, None, Some(&mut texture))
                .map_err(|e| InteropError::SurfaceError(format!("CreateTexture2D failed: {}", e)))?;
            texture.ok_or_else(|| {
                InteropError::SurfaceError("CreateTexture2D returned null".to_string())
            })?
        };

        let keyed_mutex: IDXGIKeyedMutex = texture.cast().map_err(|e| {
            InteropError::SurfaceError(format!("IDXGIKeyedMutex not supported: {}", e))
        })?;

        let resource: IDXGIResource1 = texture.cast().map_err(|e| {
            InteropError::SurfaceError(format!("IDXGIResource1 not supported: {}", e))
        })?;

        // Read-only from the primary context's perspective: the secondary
        // device writes, the rendering context only samples.
        let handle = SharedHandleGuard(unsafe {
            resource
                .CreateSharedHandle(
                    None::<*const SECURITY_ATTRIBUTES>,
                    DXGI_SHARED_RESOURCE_READ.0,
                    None,
                )
                .map_err(|e| InteropError::SurfaceError(format!("CreateSharedHandle failed: {}", e)))?
        });

        let display = unsafe { import_shared_handle(&self.render_device, handle.0, size)? };

        log::debug!(
            "Registered {}x{} shared surface into the rendering context",
            size.width,
            size.height
        );

        Ok(Box::new(D3d11Surface {
            display,
            texture,
            keyed_mutex,
            handle,
        }))
    }

    fn context_current(&self) -> bool {
        // The primary device is owned by this bridge, so it cannot vanish
        // underneath the surfaces the way a thread-current GL context can.
        true
    }

    fn describe(&self) -> &str {
        "D3D11 keyed mutex via DX12 shared handles"
    }
}

impl Drop for D3d11Bridge {
    fn drop(&mut self) {
        // Diagnostic only: surfaces still alive here are lifetime bugs in
        // the caller, worth surfacing in debug builds.
        if cfg!(debug_assertions) {
            if let Ok(debug) = self.device.cast::<ID3D11Debug>() {
                unsafe {
                    let _ = debug
                        .ReportLiveDeviceObjects(D3D11_RLDO_DETAIL | D3D11_RLDO_IGNORE_INTERNAL);
                }
            }
        }
    }
}

/// Closes the NT handle on drop.
struct SharedHandleGuard(HANDLE);

impl Drop for SharedHandleGuard {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }
}

struct D3d11Surface {
    // Field order matters: the wgpu reference to the imported resource must
    // be released before the NT handle guard below closes the handle.
    display: wgpu::Texture,
    texture: ID3D11Texture2D,
    keyed_mutex: IDXGIKeyedMutex,
    handle: SharedHandleGuard,
}

// SAFETY: all COM interfaces here belong to a multithread-protected device,
// the keyed mutex is a cross-device synchronization object, and the NT
// handle is process-global.
unsafe impl Send for D3d11Surface {}
unsafe impl Sync for D3d11Surface {}

impl BridgeSurface for D3d11Surface {
    fn lock(&self) -> bool {
        unsafe { self.keyed_mutex.AcquireSync(0, u32::MAX).is_ok() }
    }

    fn unlock(&self) -> bool {
        unsafe { self.keyed_mutex.ReleaseSync(0).is_ok() }
    }

    fn unregister(&self) {
        // The render-context side of the registration is the imported wgpu
        // texture; it is released when this surface drops, so there is no
        // separate namespace call to make.
        log::debug!("Shared surface leaving the rendering context namespace");
    }

    fn decode_target(&self) -> DecodeTarget {
        DecodeTarget(self.texture.as_raw() as usize as u64)
    }

    fn display_texture(&self) -> DisplayTexture {
        DisplayTexture::Wgpu(self.display.clone())
    }

    fn context_current(&self) -> bool {
        true
    }
}

/// Open `handle` on the primary device and wrap it as a wgpu texture.
///
/// # Safety
/// `handle` must come from `CreateSharedHandle` on a `B8G8R8A8` texture of
/// exactly `size`, and must stay open until the returned texture is dropped.
unsafe fn import_shared_handle(
    device: &wgpu::Device,
    handle: HANDLE,
    size: TextureSize,
) -> Result<wgpu::Texture, InteropError> {
    let extent = wgpu::Extent3d {
        width: size.width,
        height: size.height,
        depth_or_array_layers: 1,
    };

    let hal_texture = unsafe {
        device.as_hal::<wgpu::hal::api::Dx12, _, Result<wgpu::hal::dx12::Texture, InteropError>>(
            |hal_device| {
                let hal_device = hal_device.ok_or_else(|| {
                    InteropError::SurfaceError("wgpu device is not DX12".to_string())
                })?;

                let resource: ID3D12Resource =
                    unsafe { hal_device.raw_device().OpenSharedHandle(handle) }.map_err(|e| {
                        InteropError::SurfaceError(format!("OpenSharedHandle failed: {}", e))
                    })?;

                Ok(unsafe {
                    wgpu::hal::dx12::Device::texture_from_raw(
                        resource,
                        wgpu::TextureFormat::Bgra8Unorm,
                        wgpu::TextureDimension::D2,
                        extent,
                        1,
                        1,
                    )
                })
            },
        )?
    };

    let descriptor = wgpu::TextureDescriptor {
        label: Some("videobridge shared surface"),
        size: extent,
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Bgra8Unorm,
        usage: wgpu::TextureUsages::TEXTURE_BINDING,
        view_formats: &[],
    };

    let texture =
        unsafe { device.create_texture_from_hal::<wgpu::hal::api::Dx12>(hal_texture, &descriptor) };

    Ok(texture)
}
