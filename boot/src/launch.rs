//! Handing control to the application.

/// Transfers control to the image at `entry`.  There is no coming back.
pub trait Launcher {
    fn launch(&mut self, entry: usize) -> !;
}

/// Chain to an application through its vector table.
#[cfg(feature = "cortex-m")]
pub struct CortexM;

#[cfg(feature = "cortex-m")]
impl Launcher for CortexM {
    fn launch(&mut self, entry: usize) -> ! {
        unsafe {
            #[allow(unused_mut)]
            let mut p = cortex_m::Peripherals::steal();
            p.SCB.vtor.write(entry as u32);

            cortex_m::asm::bootload(entry as *const u32)
        }
    }
}
