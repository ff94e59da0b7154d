//! Register-level driver for the matrix engine.

use super::{
    pack_arith, pack_mcfg0, GemmFormat, GemmOp, Hwpe, HwpeError, Peripheral, HWPE_ACQUIRE, HWPE_CLK_GATE,
    HWPE_EVT_CLEAR, HWPE_SOFT_CLEAR, HWPE_STATUS, HWPE_TRIGGER, REG_ARITH, REG_MCFG0, REG_MCFG1, REG_OFFS,
    REG_W_PTR, REG_X_PTR, REG_Z_PTR,
};
use crate::fabric::memory::Memory;

/// Thin wrapper issuing register loads and stores to one HWPE.
#[derive(Clone, Copy)]
pub struct HwpeDriver<'a> {
    hwpe: &'a Hwpe,
    memory: &'a Memory,
}

impl<'a> HwpeDriver<'a> {
    pub fn new(hwpe: &'a Hwpe, memory: &'a Memory) -> Self {
        Self { hwpe, memory }
    }

    fn write(&self, offset: u32, value: u32) -> Result<(), HwpeError> {
        self.hwpe.store(self.memory, offset, value)
    }

    fn read(&self, offset: u32) -> Result<u32, HwpeError> {
        self.hwpe.load(self.memory, offset)
    }

    /// Program the job registers.
    #[allow(clippy::too_many_arguments)]
    pub fn configure(
        &self,
        x: u32,
        w: u32,
        z: u32,
        m: u16,
        n: u16,
        k: u16,
        op: GemmOp,
        fmt: GemmFormat,
    ) -> Result<(), HwpeError> {
        self.write(REG_OFFS + REG_X_PTR, x)?;
        self.write(REG_OFFS + REG_W_PTR, w)?;
        self.write(REG_OFFS + REG_Z_PTR, z)?;
        self.write(REG_OFFS + REG_MCFG0, pack_mcfg0(m, k))?;
        self.write(REG_OFFS + REG_MCFG1, n as u32)?;
        self.write(REG_OFFS + REG_ARITH, pack_arith(op, fmt))
    }

    /// Returns 0 when the engine was acquired, -1 while a job is outstanding.
    pub fn acquire_job(&self) -> Result<i32, HwpeError> {
        Ok(self.read(HWPE_ACQUIRE)? as i32)
    }

    pub fn trigger_job(&self) -> Result<(), HwpeError> {
        self.write(HWPE_TRIGGER, 0)
    }

    pub fn get_status(&self) -> Result<u32, HwpeError> {
        self.read(HWPE_STATUS)
    }

    /// Poll status until idle. Returns the number of busy polls.
    pub fn wait_idle(&self) -> Result<u32, HwpeError> {
        let mut polls = 0;
        while self.get_status()? != 0 {
            polls += 1;
        }
        Ok(polls)
    }

    pub fn soft_clear(&self) -> Result<(), HwpeError> {
        self.write(HWPE_SOFT_CLEAR, 0)
    }

    pub fn evt_clear(&self, value: u32) -> Result<(), HwpeError> {
        self.write(HWPE_EVT_CLEAR, value)
    }

    pub fn cg_enable(&self) -> Result<(), HwpeError> {
        self.write(HWPE_CLK_GATE, 1)
    }

    pub fn cg_disable(&self) -> Result<(), HwpeError> {
        self.write(HWPE_CLK_GATE, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;

    #[test]
    fn test_driver_sequence() {
        let mut mem = Memory::new();
        mem.add_region("l1", 0x1000, 0x1000).unwrap();
        // X = I(2), W = [[1, 2], [3, 4]]
        let x = [1.0f32, 0.0, 0.0, 1.0];
        let w = [1.0f32, 2.0, 3.0, 4.0];
        for i in 0..4 {
            mem.write_u16(0x1000 + 2 * i as u64, f16::from_f32(x[i]).to_bits()).unwrap();
            mem.write_u16(0x1100 + 2 * i as u64, f16::from_f32(w[i]).to_bits()).unwrap();
        }

        let hwpe = Hwpe::new(0);
        let driver = HwpeDriver::new(&hwpe, &mem);
        driver.cg_enable().unwrap();
        driver.soft_clear().unwrap();
        assert_eq!(driver.acquire_job().unwrap(), 0);
        driver
            .configure(0x1000, 0x1100, 0x1200, 2, 2, 2, GemmOp::Matmul, GemmFormat::Fp16)
            .unwrap();
        driver.trigger_job().unwrap();
        assert_eq!(driver.acquire_job().unwrap(), -1);
        assert_eq!(driver.wait_idle().unwrap(), 1);
        driver.evt_clear(1).unwrap();
        driver.cg_disable().unwrap();

        let z: Vec<f32> = (0..4)
            .map(|i| f16::from_bits(mem.read_u16(0x1200 + 2 * i).unwrap()).to_f32())
            .collect();
        assert_eq!(z, w.to_vec());

        // Gated clock rejects the next trigger
        assert_eq!(driver.acquire_job().unwrap(), 0);
        assert_eq!(driver.trigger_job(), Err(HwpeError::ClockGated));
    }
}
